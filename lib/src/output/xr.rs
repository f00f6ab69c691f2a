use std::cell::RefCell;
use std::collections::HashSet;
use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ash::vk::Handle;
use cgmath::{Angle, Matrix4, Quaternion, Rad, Rotation3, SquareMatrix, Vector3};
use wgpu::{Adapter, Device, DeviceDescriptor, Extent3d, Instance, Queue, SurfaceTarget, TextureDescriptor, TextureDimension, TextureFormat, TextureUsages, TextureView};

use crate::{APP_NAME, APP_VERSION_MAJOR, APP_VERSION_MINOR, APP_VERSION_PATCH, Main};
use crate::input::ButtonStates;
use crate::output::{DEPTH_FORMAT, NEAR_Z, FAR_Z, EyeViewport, FrameTarget, MirrorPresenter, OutputInfo, ViewMat, create_texture, eye_viewports, get_default_features, get_default_limits};

const WGPU_FORMATS: [TextureFormat; 2] = [TextureFormat::Rgba8UnormSrgb, TextureFormat::Bgra8UnormSrgb];
const NOTRUNNING_SLEEP: f32 = 0.1; // [s]
const SHUTDOWN_SLEEP: f32 = 0.01; // [s]
const SHUTDOWN_POLLS: u32 = 100;

pub struct XROutput {
    // wgpu
    device: Device,
    queue: Queue,
    adapter: Adapter,
    instance: Instance,
    color_format: TextureFormat,
    color_views: Box<[TextureView]>,
    depth_view: TextureView,
    buffer_width: u32,
    buffer_height: u32,
    viewports: [EyeViewport; 2],
    head_tracking: bool,
    hmd_info: HmdInfo,
    xr_session: openxr::Session<openxr::Vulkan>,
    inner: RefCell<Inner>,
    xr_anchor_space: openxr::Space,
    xr_view_space: openxr::Space,
    xr_action_set: openxr::ActionSet,
    xr_button_a: openxr::Action<bool>,
    xr_button_b: openxr::Action<bool>,
    xr_button_x: openxr::Action<bool>,
    xr_button_y: openxr::Action<bool>,
    xr_inst: openxr::Instance,
}

struct Inner {
    state: State,
    event_buf: openxr::EventDataBuffer,
    xr_waiter: openxr::FrameWaiter,
    xr_stream: openxr::FrameStream<openxr::Vulkan>,
    swapchain: EyeSwapchain,
    xr_space: openxr::Space, // Render space, replaced on recenter.
    last_display_t: openxr::Time,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Stopped,
    Ready,
    Visible,
    Focused,
    Exit,
}

// Outcome of one poll: nothing to do yet, one frame cycle ran (with the
// button snapshot, if input was sampled), or the session is over.
pub enum Poll {
    Idle,
    Frame(Option<ButtonStates>),
    Exit,
}

// Static properties of the connected system, queried once at startup.
#[derive(Debug)]
pub struct HmdInfo {
    pub system_name: String,
    pub vendor_id: u32,
    pub orientation_tracking: bool,
    pub position_tracking: bool,
    pub max_swapchain_width: u32,
    pub max_swapchain_height: u32,
    pub eye_width: u32,
    pub eye_height: u32,
}

impl XROutput {
    pub fn new(xr_entry: openxr::Entry, head_tracking: bool) -> Self {
        // This code is based on:
        // - https://openxr-tutorial.com/index.html
        // - https://github.com/rust-mobile/rust-android-examples/blob/main/na-openxr-wgpu/src/lib.rs
        // - https://github.com/philpax/wgpu-openxr-example

        let app_version_major: u8 = APP_VERSION_MAJOR.parse().unwrap();
        let app_version_minor: u8 = APP_VERSION_MINOR.parse().unwrap();
        let app_version_patch: u8 = APP_VERSION_PATCH.parse().unwrap();

        let app_version = (app_version_major as u32) << 24 | (app_version_minor as u32) << 16 | app_version_patch as u32;

        let wgpu_hal_flags = wgpu::InstanceFlags::default();

        // Use fullly qualified names for Vulkan/OpenXR, since they have
        // similar named structs.

        // Load Vulkan.

        let vk_entry = unsafe { ash::Entry::load() }.expect("Unable to load Vulkan");
        let drop_guard = Arc::new(Mutex::new(DropGuard::new(vk_entry.clone())));

        // Create OpenXR instance:
        // - Don't let OpenXR to create vulkan instance and device (khr_vulkan_enable2).
        // - Instead, we create it manually (khr_vulkan_enable), since we need to tell
        //   wgpu which extensions are actually enabled.

        let xr_app_info = openxr::ApplicationInfo {
            application_name: APP_NAME,
            application_version: app_version,
            engine_name: APP_NAME,
            engine_version: app_version,
            ..Default::default()
        };

        let mut xr_ext = openxr::ExtensionSet::default();
        xr_ext.khr_vulkan_enable = true;

        let xr_inst = xr_entry.create_instance(&xr_app_info, &xr_ext, &[]).expect("Unable to create OpenXR instance");
        let xr_system = xr_inst.system(openxr::FormFactor::HEAD_MOUNTED_DISPLAY).expect("OpenXR system() failed, make sure the headset is connected");

        // Check Vulkan/OpenXR compatibility.

        let xr_gfx_req = xr_inst.graphics_requirements::<openxr::Vulkan>(xr_system).expect("OpenXR graphics_requirements() failed");
        let vk_version = unsafe { vk_entry.try_enumerate_instance_version() }.expect("Vulkan try_enumerate_instance_version() failed").unwrap_or(ash::vk::API_VERSION_1_0);
        let vk_version_conv = openxr::Version::new(ash::vk::api_version_major(vk_version).try_into().unwrap(), ash::vk::api_version_minor(vk_version).try_into().unwrap(), ash::vk::api_version_patch(vk_version));

        // Runtimes commonly report a max_api_version_supported below the
        // installed Vulkan, so only the minimum is enforced.

        if vk_version_conv < xr_gfx_req.min_api_version_supported {
            panic!("Vulkan version {} mismatch, OpenXR min supported version = {}", vk_version_conv, xr_gfx_req.min_api_version_supported);
        }

        // Create Vulkan instance:
        // - Query wgpu required extensions.
        // - Query OpenXR required extensions.

        let vk_app_name = CString::new(APP_NAME).unwrap();

        let vk_app_info = ash::vk::ApplicationInfo::default()
            .application_name(&vk_app_name)
            .application_version(app_version)
            .engine_name(&vk_app_name)
            .engine_version(app_version);

        let wgpu_exts = wgpu::hal::vulkan::Instance::desired_extensions(&vk_entry, vk_version, wgpu_hal_flags).expect("wgpu desired_extensions() failed").into_iter().map(|s| s.to_str().unwrap());
        let xr_exts_str = xr_inst.vulkan_legacy_instance_extensions(xr_system).expect("OpenXR vulkan_legacy_instance_extensions() failed");
        let xr_exts = xr_exts_str.split_ascii_whitespace();

        let exts: HashSet<_> = HashSet::from_iter(wgpu_exts.chain(xr_exts)); // Deduplicate.
        let exts_c: Box<[_]> = exts.into_iter().map(|s| CString::new(s).unwrap()).collect();
        let exts_c_ptr: Box<[_]> = exts_c.iter().map(|s| s.as_ptr()).collect();

        let vk_inst_create_info = ash::vk::InstanceCreateInfo::default()
            .application_info(&vk_app_info)
            .enabled_extension_names(&exts_c_ptr);

        let vk_inst = unsafe { vk_entry.create_instance(&vk_inst_create_info, None) }.expect("Unable to create Vulkan instance");
        drop_guard.lock().unwrap().set_vk_inst(vk_inst.clone());

        // Get suitable Vulkan physical device.

        let vk_phys_dev_handle = unsafe { xr_inst.vulkan_graphics_device(xr_system, vk_inst.handle().as_raw() as _) }.expect("OpenXR vulkan_graphics_device() failed");
        let vk_phys_dev = ash::vk::PhysicalDevice::from_raw(vk_phys_dev_handle as _);

        // Find graphics queue.

        let vk_queue_families = unsafe { vk_inst.get_physical_device_queue_family_properties(vk_phys_dev) };
        let vk_queue_family_index = vk_queue_families
            .into_iter()
            .enumerate()
            .find_map(|(family_index, family)| {
                if family.queue_flags.contains(ash::vk::QueueFlags::GRAPHICS) {
                    Some(family_index.try_into().unwrap())
                } else {
                    None
                }
            })
            .expect("Unable to find suitable graphics queue");

        let vk_queue_create_info = ash::vk::DeviceQueueCreateInfo::default()
            .queue_family_index(vk_queue_family_index)
            .queue_priorities(&[1.0]);
        let vk_queue_create_infos = [vk_queue_create_info];

        // Init wgpu.

        let wgpu_hal_exts: Vec<_> = exts_c.into_iter().map(|s| Box::leak(Box::new(s)).as_c_str()).collect(); // TODO: How to do it without leak?

        // Dummy closure is created to hold drop_guard.

        let drop_callback: Option<wgpu::hal::DropCallback> = {
            let drop_guard = Arc::clone(&drop_guard);
            Some(Box::new(move || { let _ = Arc::strong_count(&drop_guard); }))
        };
        let wgpu_hal_inst = unsafe { wgpu::hal::vulkan::Instance::from_raw(vk_entry, vk_inst.clone(), vk_version, 0, None, wgpu_hal_exts, wgpu_hal_flags, Default::default(), false, drop_callback) }.expect("wgpu from_raw() failed");
        let wgpu_hal_adapter = wgpu_hal_inst.expose_adapter(vk_phys_dev).expect("wgpu expose_adapter() failed");

        // Create Vulkan device:
        // - Query wgpu required extensions.
        // - Query OpenXR required extensions.

        let wgpu_features = get_default_features();

        let wgpu_exts = wgpu_hal_adapter.adapter.required_device_extensions(wgpu_features).into_iter().map(|s| s.to_str().unwrap());
        let xr_exts_str = xr_inst.vulkan_legacy_device_extensions(xr_system).expect("OpenXR vulkan_legacy_device_extensions() failed");
        let xr_exts = xr_exts_str.split_ascii_whitespace();

        let exts: HashSet<_> = HashSet::from_iter(wgpu_exts.chain(xr_exts)); // Deduplicate.
        let exts_c: Box<[_]> = exts.iter().map(|s| CString::new(*s).unwrap()).collect();
        let exts_c_ptr: Box<[_]> = exts_c.iter().map(|s| s.as_ptr()).collect();

        let vk_dev_create_info = ash::vk::DeviceCreateInfo::default()
            .queue_create_infos(&vk_queue_create_infos)
            .enabled_extension_names(&exts_c_ptr);

        let wgpu_phys_exts: Box<[_]> = exts_c.into_iter().map(|s| Box::leak(Box::new(s)).as_c_str()).collect(); // TODO: How to do it without leak?
        let mut wgpu_phys_features = wgpu_hal_adapter.adapter.physical_device_features(&wgpu_phys_exts, wgpu_features);
        let vk_dev_create_info2 = wgpu_phys_features.add_to_device_create(vk_dev_create_info);

        let vk_dev = unsafe { vk_inst.create_device(vk_phys_dev, &vk_dev_create_info2, None) }.expect("Vulkan create_device() failed");
        drop_guard.lock().unwrap().set_vk_dev(vk_dev.clone());

        // Create OpenXR session.

        let xr_session_create_info = openxr::vulkan::SessionCreateInfo {
            instance: vk_inst.handle().as_raw() as _,
            physical_device: vk_phys_dev_handle,
            device: vk_dev.handle().as_raw() as _,
            queue_family_index: vk_queue_family_index,
            queue_index: 0,
        };

        let (xr_session, xr_waiter, xr_stream) = unsafe { xr_inst.create_session_with_guard::<openxr::Vulkan>(xr_system, &xr_session_create_info, Box::new(Arc::clone(&drop_guard))) }.expect("Unable to create OpenXR session");

        // Query color formats.

        let xr_formats = xr_session.enumerate_swapchain_formats().expect("OpenXR enumerate_swapchain_formats() failed");
        let mut format_info = None;

        for xr_format in xr_formats {
            format_info = WGPU_FORMATS.iter().find_map(|wgpu_format| {
                if wgpu_hal_adapter.adapter.texture_format_as_raw(*wgpu_format).as_raw() == xr_format as i32 {
                    Some((xr_format, *wgpu_format))
                } else {
                    None
                }
            });

            if format_info.is_some() {
                break;
            }
        };

        let format_info = format_info.expect("Unable to select swapchain format");
        let color_format = format_info.1;

        // Create wgpu device.

        // Dummy closure is created to hold drop_guard.

        let drop_callback: Option<wgpu::hal::DropCallback> = {
            let drop_guard = Arc::clone(&drop_guard);
            Some(Box::new(move || { let _ = Arc::strong_count(&drop_guard); }))
        };
        let wgpu_hal_dev = unsafe { wgpu_hal_adapter.adapter.device_from_raw(vk_dev.clone(), drop_callback, &wgpu_phys_exts, wgpu_features, &Default::default(), vk_queue_family_index, 0) }.expect("wgpu device_from_raw() failed");

        let instance = unsafe { Instance::from_hal::<wgpu::hal::vulkan::Api>(wgpu_hal_inst) };
        let adapter = unsafe { instance.create_adapter_from_hal(wgpu_hal_adapter) };

        let device_desc = DeviceDescriptor {
            required_features: wgpu_features,
            required_limits: get_default_limits(),
            ..Default::default()
        };
        let (device, queue) = unsafe { adapter.create_device_from_hal(wgpu_hal_dev, &device_desc) }.expect("wgpu create_device_from_hal() failed");

        // Setup swapchain. Both eye views are packed side by side into one
        // double-wide image, so the buffer is twice the recommended eye width.

        let xr_views = xr_inst.enumerate_view_configuration_views(xr_system, openxr::ViewConfigurationType::PRIMARY_STEREO).expect("OpenXR enumerate_view_configuration_views() failed");
        assert!(xr_views.len() == 2); // Make sure we have stereo configuration.
        assert!(xr_views[0] == xr_views[1]);

        let eye_width = xr_views[0].recommended_image_rect_width;
        let eye_height = xr_views[0].recommended_image_rect_height;

        let buffer_width = 2 * eye_width;
        let buffer_height = eye_height;
        let viewports = eye_viewports(buffer_width, buffer_height);

        let xr_system_prop = xr_inst.system_properties(xr_system).expect("OpenXR system_properties() failed");

        let hmd_info = HmdInfo {
            system_name: xr_system_prop.system_name.clone(),
            vendor_id: xr_system_prop.vendor_id,
            orientation_tracking: xr_system_prop.tracking_properties.orientation_tracking,
            position_tracking: xr_system_prop.tracking_properties.position_tracking,
            max_swapchain_width: xr_system_prop.graphics_properties.max_swapchain_image_width,
            max_swapchain_height: xr_system_prop.graphics_properties.max_swapchain_image_height,
            eye_width,
            eye_height,
        };

        let swapchain = EyeSwapchain::new(&xr_session, buffer_width, buffer_height, format_info.0);
        let swapchain_imgs = swapchain.enumerate_images();

        let wgpu_color_descr_hal = wgpu::hal::TextureDescriptor {
            label: None,
            size: Extent3d {
                width: buffer_width,
                height: buffer_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: color_format,
            usage: wgpu::wgt::TextureUses::COLOR_TARGET | wgpu::wgt::TextureUses::RESOURCE,
            memory_flags: wgpu::hal::MemoryFlags::empty(),
            view_formats: vec![],
        };

        let wgpu_color_descr = TextureDescriptor {
            label: None,
            size: Extent3d {
                width: buffer_width,
                height: buffer_height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: TextureDimension::D2,
            format: color_format,
            usage: TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        };

        let wgpu_hal_dev = unsafe { device.as_hal::<wgpu::hal::vulkan::Api>().unwrap() };

        let color_views = swapchain_imgs.into_iter().map(|texture_raw| {
            let texture_handle = ash::vk::Image::from_raw(texture_raw);
            let texture_hal = unsafe { wgpu_hal_dev.texture_from_raw(texture_handle, &wgpu_color_descr_hal, Some(Box::new(|| {})), wgpu::hal::vulkan::TextureMemory::External) }; // Don't take ownership of the texture.
            let texture = unsafe { device.create_texture_from_hal::<wgpu::hal::vulkan::Api>(texture_hal, &wgpu_color_descr) };
            texture.create_view(&Default::default())
        }).collect();

        // Setup depth buffer.

        let depth_texture = create_texture(&device, buffer_width, buffer_height, DEPTH_FORMAT);
        let depth_view = depth_texture.create_view(&Default::default());

        // Setup spaces. The anchor stays at the runtime stage origin forever;
        // the render space starts there too and is replaced on recenter.

        let xr_anchor_space = xr_session.create_reference_space(openxr::ReferenceSpaceType::STAGE, openxr::Posef::IDENTITY).expect("OpenXR create_reference_space() failed");
        let xr_space = xr_session.create_reference_space(openxr::ReferenceSpaceType::STAGE, openxr::Posef::IDENTITY).expect("OpenXR create_reference_space() failed");
        let xr_view_space = xr_session.create_reference_space(openxr::ReferenceSpaceType::VIEW, openxr::Posef::IDENTITY).expect("OpenXR create_reference_space() failed");

        // Setup input. A/B live on the right Touch controller, X/Y on the left.

        let xr_action_set = xr_inst.create_action_set("input", "Input", 0).expect("OpenXR create_action_set() failed");

        let xr_button_a = xr_action_set.create_action::<bool>("button_a", "Button A", &[]).expect("OpenXR create_action() failed");
        let xr_button_b = xr_action_set.create_action::<bool>("button_b", "Button B", &[]).expect("OpenXR create_action() failed");
        let xr_button_x = xr_action_set.create_action::<bool>("button_x", "Button X", &[]).expect("OpenXR create_action() failed");
        let xr_button_y = xr_action_set.create_action::<bool>("button_y", "Button Y", &[]).expect("OpenXR create_action() failed");

        xr_inst.suggest_interaction_profile_bindings(
            xr_inst.string_to_path("/interaction_profiles/oculus/touch_controller").expect("OpenXR string_to_path() failed"),
            &[
                openxr::Binding::new(
                    &xr_button_a,
                    xr_inst.string_to_path("/user/hand/right/input/a/click").expect("OpenXR string_to_path() failed"),
                ),
                openxr::Binding::new(
                    &xr_button_b,
                    xr_inst.string_to_path("/user/hand/right/input/b/click").expect("OpenXR string_to_path() failed"),
                ),
                openxr::Binding::new(
                    &xr_button_x,
                    xr_inst.string_to_path("/user/hand/left/input/x/click").expect("OpenXR string_to_path() failed"),
                ),
                openxr::Binding::new(
                    &xr_button_y,
                    xr_inst.string_to_path("/user/hand/left/input/y/click").expect("OpenXR string_to_path() failed"),
                )
            ]).expect("OpenXR suggest_interaction_profile_bindings() failed");

        xr_session.attach_action_sets(&[&xr_action_set]).expect("OpenXR attach_action_sets() failed");

        Self {
            device,
            queue,
            adapter,
            instance,
            color_format,
            color_views,
            depth_view,
            buffer_width,
            buffer_height,
            viewports,
            head_tracking,
            hmd_info,
            xr_session,
            inner: RefCell::new(Inner {
                state: State::Stopped,
                event_buf: openxr::EventDataBuffer::new(),
                xr_waiter,
                xr_stream,
                swapchain,
                xr_space,
                last_display_t: openxr::Time::from_nanos(0),
            }),
            xr_anchor_space,
            xr_view_space,
            xr_action_set,
            xr_button_a,
            xr_button_b,
            xr_button_x,
            xr_button_y,
            xr_inst,
        }
    }

    pub fn get_info(&self) -> OutputInfo {
        OutputInfo::new(&self.device, &self.queue, self.color_format, DEPTH_FORMAT, self.buffer_width, self.buffer_height)
    }

    pub fn get_hmd_info(&self) -> &HmdInfo {
        &self.hmd_info
    }

    pub fn get_buffer_size(&self) -> (u32, u32) {
        (self.buffer_width, self.buffer_height)
    }

    // Mirror failure is not fatal, the session keeps running without the
    // desktop view.

    pub fn create_mirror(&self, surface_target: SurfaceTarget<'static>, width: u32, height: u32) -> Option<MirrorPresenter> {
        match MirrorPresenter::new(&self.instance, &self.adapter, &self.device, &self.queue, &self.color_views, surface_target, width, height) {
            Ok(mirror) => Some(mirror),
            Err(err) => {
                log::warn!("Mirror window disabled: {:?}", err);
                None
            },
        }
    }

    pub fn poll(&self, main: &Main, mirror_opt: Option<&MirrorPresenter>) -> Poll {
        let inner = &mut *self.inner.borrow_mut();

        let old_state = inner.state;
        assert!(!matches!(old_state, State::Exit)); // Once exited, no more poll is possible.

        self.poll_impl(inner);
        let new_state = inner.state;

        if old_state != new_state {
            log::debug!("Session state: {:?}", new_state);
        }

        match new_state {
            State::Stopped => {
                thread::sleep(Duration::from_secs_f32(NOTRUNNING_SLEEP));
                Poll::Idle
            },
            State::Ready | State::Visible | State::Focused => {
                Poll::Frame(self.frame_cycle(inner, main, mirror_opt))
            },
            State::Exit => Poll::Exit,
        }
    }

    fn poll_impl(&self, inner: &mut Inner) {
        while let Some(event) = self.xr_inst.poll_event(&mut inner.event_buf).expect("OpenXR poll_event() failed") {
            match event {
                openxr::Event::SessionStateChanged(event) => {
                    match event.state() {
                        openxr::SessionState::READY => {
                            self.xr_session.begin(openxr::ViewConfigurationType::PRIMARY_STEREO).expect("OpenXR begin() failed");
                            inner.state = State::Ready;
                        },
                        openxr::SessionState::STOPPING => {
                            self.xr_session.end().expect("OpenXR end() failed");
                            inner.state = State::Stopped;
                        },
                        openxr::SessionState::FOCUSED => {
                            inner.state = State::Focused;
                        },
                        openxr::SessionState::VISIBLE => {
                            inner.state = State::Visible;
                        },
                        openxr::SessionState::EXITING | openxr::SessionState::LOSS_PENDING => {
                            inner.state = State::Exit;
                        },
                        _ => (),
                    }
                },
                openxr::Event::InstanceLossPending(_) => {
                    inner.state = State::Exit;
                },
                _ => (),
            };
        }
    }

    // One full frame: wait for the compositor, render both eyes, hand the
    // image back, then present the mirror copy. Returns the button snapshot,
    // or None when nothing was rendered or the controllers are not tracked.
    fn frame_cycle(&self, inner: &mut Inner, main: &Main, mirror_opt: Option<&MirrorPresenter>) -> Option<ButtonStates> {
        let frame_state = inner.xr_waiter.wait().expect("OpenXR wait() failed");
        inner.xr_stream.begin().expect("OpenXR begin() failed");

        let display_t = frame_state.predicted_display_time;
        inner.last_display_t = display_t;

        if !frame_state.should_render { // See openxr::SessionState::SYNCHRONIZED.
            inner.xr_stream.end(display_t, openxr::EnvironmentBlendMode::OPAQUE, &[]).expect("OpenXR end() failed");
            return None;
        }

        // Acquire next image from swapchain.

        let color_index = inner.swapchain.acquire();
        let color_view = &self.color_views[color_index as usize];

        // Calculate view matrices.

        let (_, views) = self.xr_session.locate_views(openxr::ViewConfigurationType::PRIMARY_STEREO, display_t, &inner.xr_space).expect("OpenXR locate_views() failed");
        assert!(views.len() == 2);

        let mut view_m: [ViewMat; 2] = [Matrix4::identity().into(), Matrix4::identity().into()];

        for (view, view_m_single) in views.iter().zip(view_m.iter_mut()) {
            let proj_m = perspective(&view.fov, NEAR_Z, FAR_Z);

            let cam_m = if self.head_tracking {
                pose_inverse(&view.pose)
            } else {
                // Fixed eyepoint, the quads stay glued in front of the viewer.
                Matrix4::identity()
            };

            *view_m_single = (proj_m * cam_m).into();
        }

        let frame = FrameTarget::new(color_view, &self.depth_view, self.viewports, view_m);
        main.render(&frame);

        // Encode the mirror copy while the image is still ours. It is
        // presented only after the frame went to the compositor.

        let mirror_frame_opt = mirror_opt.and_then(|mirror| mirror.blit(color_index as usize));

        inner.swapchain.commit();

        let layer_views = [
            openxr::CompositionLayerProjectionView::new()
                .pose(views[0].pose)
                .fov(views[0].fov)
                .sub_image(openxr::SwapchainSubImage::new()
                    .swapchain(inner.swapchain.get_handle())
                    .image_array_index(0)
                    .image_rect(to_rect(&self.viewports[0]))
                ),
            openxr::CompositionLayerProjectionView::new()
                .pose(views[1].pose)
                .fov(views[1].fov)
                .sub_image(openxr::SwapchainSubImage::new()
                    .swapchain(inner.swapchain.get_handle())
                    .image_array_index(0) // Same image, the eyes are split by rect.
                    .image_rect(to_rect(&self.viewports[1]))
                ),
        ];

        let layer = openxr::CompositionLayerProjection::new()
            .space(&inner.xr_space)
            .views(&layer_views);

        inner.xr_stream.end(display_t, openxr::EnvironmentBlendMode::OPAQUE, &[&layer]).expect("OpenXR end() failed");

        if let Some(mirror_frame) = mirror_frame_opt {
            mirror_frame.present();
        }

        // Buttons are read after the frame went out, their edges apply
        // between cycles.

        self.poll_buttons()
    }

    fn poll_buttons(&self) -> Option<ButtonStates> {
        self.xr_session.sync_actions(&[(&self.xr_action_set).into()]).expect("OpenXR sync_actions() failed");

        let a = self.xr_button_a.state(&self.xr_session, openxr::Path::NULL).expect("OpenXR state() failed");
        let b = self.xr_button_b.state(&self.xr_session, openxr::Path::NULL).expect("OpenXR state() failed");
        let x = self.xr_button_x.state(&self.xr_session, openxr::Path::NULL).expect("OpenXR state() failed");
        let y = self.xr_button_y.state(&self.xr_session, openxr::Path::NULL).expect("OpenXR state() failed");

        if !(a.is_active || b.is_active || x.is_active || y.is_active) {
            return None; // Controllers are not tracked, keep previous edge state.
        }

        Some(ButtonStates {
            a: a.is_active && a.current_state,
            b: b.is_active && b.current_state,
            x: x.is_active && x.current_state,
            y: y.is_active && y.current_state,
        })
    }

    pub fn recenter(&self) {
        let inner = &mut *self.inner.borrow_mut();

        // Head pose is taken in the fixed anchor space, not in the current
        // (possibly already offset) render space, so repeated recenters do
        // not compound.

        let location = self.xr_view_space.locate(&self.xr_anchor_space, inner.last_display_t).expect("OpenXR locate() failed");

        if !location.location_flags.contains(openxr::SpaceLocationFlags::POSITION_VALID | openxr::SpaceLocationFlags::ORIENTATION_VALID) {
            log::warn!("Recenter skipped, head pose is not tracked");
            return;
        }

        // Keep position and yaw only, the new origin must stay level.

        let rot = location.pose.orientation;
        let forward = Quaternion::new(rot.w, rot.x, rot.y, rot.z) * Vector3::new(0.0, 0.0, -1.0);
        let yaw_rot = Quaternion::from_angle_y(Rad((-forward.x).atan2(-forward.z)));

        let pose = openxr::Posef {
            orientation: openxr::Quaternionf {
                x: yaw_rot.v.x,
                y: yaw_rot.v.y,
                z: yaw_rot.v.z,
                w: yaw_rot.s,
            },
            position: location.pose.position,
        };

        inner.xr_space = self.xr_session.create_reference_space(openxr::ReferenceSpaceType::STAGE, pose).expect("OpenXR create_reference_space() failed");
        log::info!("Tracking origin recentered");
    }

    // Ask the runtime to end the session, then keep pumping events until it
    // confirms, so teardown happens from a properly ended session.
    pub fn shutdown(&self) {
        if self.xr_session.request_exit().is_err() {
            return; // Session is not running anymore.
        }

        let inner = &mut *self.inner.borrow_mut();

        for _ in 0..SHUTDOWN_POLLS {
            self.poll_impl(inner);

            if matches!(inner.state, State::Exit) {
                return;
            }

            thread::sleep(Duration::from_secs_f32(SHUTDOWN_SLEEP));
        }

        log::warn!("Session did not reach the exiting state");
    }
}

// Double-wide color swapchain, one image holds both eye views.
struct EyeSwapchain {
    xr_swapchain: openxr::Swapchain<openxr::Vulkan>,
}

impl EyeSwapchain {
    fn new(xr_session: &openxr::Session<openxr::Vulkan>, width: u32, height: u32, format: u32) -> Self {
        let xr_swapchain_create_info = openxr::SwapchainCreateInfo {
            create_flags: openxr::SwapchainCreateFlags::EMPTY,
            usage_flags: openxr::SwapchainUsageFlags::COLOR_ATTACHMENT | openxr::SwapchainUsageFlags::SAMPLED, // Sampled, the mirror blit reads it back.
            format,
            sample_count: 1,
            width,
            height,
            face_count: 1,
            array_size: 1,
            mip_count: 1,
        };

        let xr_swapchain = xr_session.create_swapchain(&xr_swapchain_create_info).expect("OpenXR create_swapchain() failed");

        Self {
            xr_swapchain,
        }
    }

    fn enumerate_images(&self) -> Vec<u64> {
        self.xr_swapchain.enumerate_images().expect("OpenXR enumerate_images() failed")
    }

    // The returned index is the only image that may be written until commit().
    fn acquire(&mut self) -> u32 {
        let color_index = self.xr_swapchain.acquire_image().expect("OpenXR acquire_image() failed");
        self.xr_swapchain.wait_image(openxr::Duration::INFINITE).expect("OpenXR wait_image() failed");
        color_index
    }

    // Hands the image back to the compositor, exactly once per acquire.
    fn commit(&mut self) {
        self.xr_swapchain.release_image().expect("OpenXR release_image() failed");
    }

    fn get_handle(&self) -> &openxr::Swapchain<openxr::Vulkan> {
        &self.xr_swapchain
    }
}

struct DropGuard {
    vk_inst: Option<ash::Instance>,
    vk_dev: Option<ash::Device>,
    _vk_entry: ash::Entry, // Make sure it is dropped last.
}

impl DropGuard {
    fn new(vk_entry: ash::Entry) -> Self {
        Self {
            vk_inst: None,
            vk_dev: None,
            _vk_entry: vk_entry,
        }
    }

    fn set_vk_inst(&mut self, vk_inst: ash::Instance) {
        assert!(self.vk_inst.is_none());
        self.vk_inst = Some(vk_inst);
    }

    fn set_vk_dev(&mut self, vk_dev: ash::Device) {
        assert!(self.vk_dev.is_none());
        self.vk_dev = Some(vk_dev);
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        // Implementation notes:
        // - OpenXR/wgpu are not going to take the ownership of the Vulkan handles created in XROutput->new().
        // - DropGuard is wrapped into an Arc, which is referenced by drop guards of OpenXR/wgpu. The handles
        //   are actually dropped, once the Arc reference count reaches 0.

        if let Some(vk_dev) = &self.vk_dev {
            // From https://docs.rs/ash/latest/ash/struct.Instance.html#method.create_device :
            // The application must not destroy the parent Instance object before first destroying the returned Device child object. Device does not implement drop semantics and can only be destroyed via destroy_device().

            unsafe { vk_dev.destroy_device(None) };
        }

        if let Some(vk_inst) = &self.vk_inst {
            // From https://docs.rs/ash/latest/ash/struct.Entry.html#method.create_instance :
            // Instance does not implement drop semantics and can only be destroyed via destroy_instance().

            unsafe { vk_inst.destroy_instance(None) };
        }

        // From https://docs.rs/ash/latest/ash/struct.Entry.html#method.load :
        // No Vulkan functions loaded directly or indirectly from this Entry may be called after it is dropped.
    }
}

fn to_rect(viewport: &EyeViewport) -> openxr::Rect2Di {
    openxr::Rect2Di {
        offset: openxr::Offset2Di {
            x: viewport.x.try_into().unwrap(),
            y: viewport.y.try_into().unwrap(),
        },
        extent: openxr::Extent2Di {
            width: viewport.width.try_into().unwrap(),
            height: viewport.height.try_into().unwrap(),
        },
    }
}

fn pose_inverse(pose: &openxr::Posef) -> Matrix4<f32> {
    // We are doing the pose matrix inversion manually, since it is trivial.

    let pos = pose.position;
    let pos_m = Matrix4::from_translation(Vector3::new(-pos.x, -pos.y, -pos.z));

    let rot = pose.orientation;
    let rot_m = Matrix4::from(Quaternion::new(rot.w, rot.x, rot.y, rot.z).conjugate());

    rot_m * pos_m
}

fn perspective(fov: &openxr::Fovf, near: f32, far: f32) -> Matrix4<f32> {
    // Calculate projection matrix.
    // Taken from https://github.com/KhronosGroup/OpenXR-SDK/blob/main/src/common/xr_linear.h->XrMatrix4x4f_CreateProjectionFov.

    let tan_left = Rad(fov.angle_left).tan();
    let tan_right = Rad(fov.angle_right).tan();
    let tan_up = Rad(fov.angle_up).tan();
    let tan_down = Rad(fov.angle_down).tan();

    let tan_width = tan_right - tan_left;
    let tan_height = tan_up - tan_down;

    Matrix4::new(
        2.0 / tan_width, 0.0, 0.0, 0.0,
        0.0, 2.0 / tan_height, 0.0, 0.0,
        (tan_right + tan_left) / tan_width, (tan_up + tan_down) / tan_height, -far / (far - near), -1.0,
        0.0, 0.0, -(far * near) / (far - near), 0.0
    )
}
