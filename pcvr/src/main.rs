use std::process;
use std::sync::Arc;
use std::time::Duration;

use wgpu::SurfaceTarget;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, EventLoop};
use winit::platform::pump_events::{EventLoopExtPumpEvents, PumpStatus};
use winit::window::{Window, WindowId};

use stereocmp_lib::{APP_NAME, APP_VERSION_MAJOR, APP_VERSION_MINOR, APP_VERSION_PATCH, Main};
use stereocmp_lib::config::AppConfig;
use stereocmp_lib::frameloop::{FrameLoop, Step};
use stereocmp_lib::imageset::ImageSet;
use stereocmp_lib::input::InputAction;
use stereocmp_lib::output::{Poll, XROutput};

const EXIT_INIT_FAILED: i32 = -1;

struct App {
    window_size: PhysicalSize<u32>,
    window: Option<Arc<Window>>,
    create_failed: bool,
    close_requested: bool,
    resized: Option<PhysicalSize<u32>>,
}

impl App {
    fn new(width: u32, height: u32) -> Self {
        Self {
            window_size: PhysicalSize::new(width, height),
            window: None,
            create_failed: false,
            close_requested: false,
            resized: None,
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() && !self.create_failed {
            // From https://docs.rs/winit/latest/winit/application/trait.ApplicationHandler.html#tymethod.resumed :
            // "It's recommended that applications should only initialize their graphics context and create a window after they have received their first Resumed event."

            let window_attrs = Window::default_attributes()
                .with_title(APP_NAME)
                .with_inner_size(self.window_size)
                .with_resizable(false);

            match event_loop.create_window(window_attrs) {
                Ok(window) => self.window = Some(Arc::new(window)),
                Err(e) => {
                    log::error!("Unable to create window: {}", e);
                    self.create_failed = true;
                },
            }
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _window_id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::Resized(size) => self.resized = Some(size),
            WindowEvent::CloseRequested => self.close_requested = true,
            _ => (),
        }
    }
}

fn main() {
    env_logger::init();

    log::info!("{} {}.{}.{}", APP_NAME, APP_VERSION_MAJOR, APP_VERSION_MINOR, APP_VERSION_PATCH);

    let config = AppConfig::default();

    // The compositor paces the session, so the winit side runs in pump mode:
    // window events are drained once per cycle and never block.

    let mut event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("Unable to create event loop: {}", e);
            process::exit(EXIT_INIT_FAILED);
        },
    };

    let mut app = App::new(config.window_width, config.window_height);

    if let PumpStatus::Exit(code) = event_loop.pump_app_events(Some(Duration::ZERO), &mut app) {
        process::exit(code);
    }

    if app.create_failed {
        process::exit(EXIT_INIT_FAILED);
    }

    let xr_entry = unsafe { openxr::Entry::load() }.expect("Unable to load OpenXR");
    let output = XROutput::new(xr_entry, config.head_tracking);

    let hmd_info = output.get_hmd_info();
    log::info!("HMD: {} (vendor 0x{:04x})", hmd_info.system_name, hmd_info.vendor_id);
    log::info!("Tracking: orientation = {}, position = {}", hmd_info.orientation_tracking, hmd_info.position_tracking);

    let (buffer_width, buffer_height) = output.get_buffer_size();
    log::info!("Eye buffer: {}x{}", buffer_width, buffer_height);
    log::info!("Buttons: A = recenter, B = quit, X = low quality, Y = high quality");

    let mirror = app.window.as_ref().and_then(|window| output.create_mirror(SurfaceTarget::from(Arc::clone(window)), config.window_width, config.window_height));

    let images = ImageSet::load(&output.get_info(), &config.images).expect("Unable to load comparison images");
    let main = Main::new(output.get_info(), images, &config);

    let mut frame_loop = FrameLoop::new();

    // Do XR loop.

    loop {
        if let PumpStatus::Exit(_) = event_loop.pump_app_events(Some(Duration::ZERO), &mut app) {
            break;
        }

        if app.close_requested {
            break;
        }

        if let (Some(size), Some(mirror)) = (app.resized.take(), mirror.as_ref()) {
            mirror.resize(size.width, size.height);
        }

        match output.poll(&main, mirror.as_ref()) {
            Poll::Idle => (),
            Poll::Frame(buttons_opt) => match frame_loop.advance(buttons_opt) {
                Step::Continue(Some(InputAction::Recenter)) => output.recenter(),
                Step::Continue(Some(InputAction::SetHighQuality(high_quality))) => main.set_high_quality(high_quality),
                Step::Continue(_) => (),
                Step::Quit => {
                    log::info!("Quit requested after {} frames", frame_loop.get_frame_index());
                    break;
                },
            },
            Poll::Exit => break,
        }
    }

    output.shutdown();
}
