use std::path::Path;

use image::{DynamicImage, Rgba, RgbaImage};

use crate::config::AppConfig;
use crate::frameloop::{FrameLoop, Step};
use crate::imageset::orient;
use crate::input::{ButtonMapper, ButtonStates, Edge, EdgeDetector, InputAction};
use crate::output::eye_viewports;

#[test]
fn test_orient_transposes() {
    let mut img = RgbaImage::new(3, 2);

    for y in 0..2u32 {
        for x in 0..3u32 {
            img.put_pixel(x, y, Rgba([(10 * x) as u8, (10 * y) as u8, 0, 255]));
        }
    }

    let oriented = orient(DynamicImage::ImageRgba8(img.clone())).to_rgba8();

    assert_eq!(oriented.dimensions(), (2, 3));

    for y in 0..2u32 {
        for x in 0..3u32 {
            assert_eq!(oriented.get_pixel(y, x), img.get_pixel(x, y));
        }
    }
}

#[test]
fn test_eye_viewports() {
    let [left, right] = eye_viewports(1600, 900);

    assert_eq!((left.x, left.y, left.width, left.height), (0, 0, 800, 900));
    assert_eq!((right.x, right.y, right.width, right.height), (800, 0, 800, 900));
}

#[test]
fn test_edge_detector() {
    let mut detector = EdgeDetector::new();

    assert_eq!(detector.update(false), None);
    assert_eq!(detector.update(true), Some(Edge::Rising));
    assert_eq!(detector.update(true), None);
    assert_eq!(detector.update(false), Some(Edge::Falling));
    assert_eq!(detector.update(false), None);
}

#[test]
fn test_edge_detector_held_at_start() {
    let mut detector = EdgeDetector::new();

    // The first sample only sets the baseline.
    assert_eq!(detector.update(true), None);
    assert_eq!(detector.update(false), Some(Edge::Falling));
}

#[test]
fn test_button_mapper_fires_on_release() {
    let mut mapper = ButtonMapper::new();

    assert_eq!(mapper.update(&ButtonStates::default()), None);
    assert_eq!(mapper.update(&ButtonStates { a: true, ..Default::default() }), None);
    assert_eq!(mapper.update(&ButtonStates::default()), Some(InputAction::Recenter));
    assert_eq!(mapper.update(&ButtonStates::default()), None);
}

#[test]
fn test_button_mapper_quality() {
    let mut mapper = ButtonMapper::new();

    assert_eq!(mapper.update(&ButtonStates::default()), None);
    assert_eq!(mapper.update(&ButtonStates { x: true, ..Default::default() }), None);
    assert_eq!(mapper.update(&ButtonStates::default()), Some(InputAction::SetHighQuality(false)));
    assert_eq!(mapper.update(&ButtonStates { y: true, ..Default::default() }), None);
    assert_eq!(mapper.update(&ButtonStates::default()), Some(InputAction::SetHighQuality(true)));
}

#[test]
fn test_button_mapper_single_action() {
    let mut mapper = ButtonMapper::new();

    let all = ButtonStates {
        a: true,
        b: true,
        x: true,
        y: true,
    };

    assert_eq!(mapper.update(&ButtonStates::default()), None);
    assert_eq!(mapper.update(&all), None);

    // All four released at once: the first button in order fires, the other
    // edges are consumed.
    assert_eq!(mapper.update(&ButtonStates::default()), Some(InputAction::Recenter));
    assert_eq!(mapper.update(&ButtonStates::default()), None);
}

#[test]
fn test_frame_loop_counts_every_cycle() {
    let mut frame_loop = FrameLoop::new();

    assert_eq!(frame_loop.get_frame_index(), 0);
    assert!(matches!(frame_loop.advance(None), Step::Continue(None)));
    assert!(matches!(frame_loop.advance(Some(ButtonStates::default())), Step::Continue(None)));
    assert!(matches!(frame_loop.advance(None), Step::Continue(None)));
    assert_eq!(frame_loop.get_frame_index(), 3);
}

#[test]
fn test_frame_loop_quit() {
    let mut frame_loop = FrameLoop::new();

    assert!(matches!(frame_loop.advance(Some(ButtonStates { b: true, ..Default::default() })), Step::Continue(None)));
    assert!(matches!(frame_loop.advance(Some(ButtonStates::default())), Step::Quit));
}

#[test]
fn test_frame_loop_keeps_edges_across_skipped_polls() {
    let mut frame_loop = FrameLoop::new();

    assert!(matches!(frame_loop.advance(Some(ButtonStates { a: true, ..Default::default() })), Step::Continue(None)));
    assert!(matches!(frame_loop.advance(None), Step::Continue(None)));
    assert!(matches!(frame_loop.advance(None), Step::Continue(None)));

    // The release still fires after cycles without input sampling.
    assert!(matches!(frame_loop.advance(Some(ButtonStates::default())), Step::Continue(Some(InputAction::Recenter))));
    assert_eq!(frame_loop.get_frame_index(), 4);
}

#[test]
fn test_config_defaults() {
    let config = AppConfig::default();

    assert_eq!(config.window_width, 800);
    assert_eq!(config.window_height, 600);
    assert!(!config.head_tracking);
    assert!(!config.high_quality);
    assert!(config.perf_summary);

    assert_eq!(config.images.reference_left, Path::new("images/reference_left.ppm"));
    assert_eq!(config.images.reference_right, Path::new("images/reference_right.ppm"));
    assert_eq!(config.images.processed_left, Path::new("images/processed_left.ppm"));
    assert_eq!(config.images.processed_right, Path::new("images/processed_right.ppm"));
}
