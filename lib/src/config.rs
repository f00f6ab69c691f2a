use std::path::PathBuf;

const DEFAULT_WINDOW_WIDTH: u32 = 800;
const DEFAULT_WINDOW_HEIGHT: u32 = 600;

// Comparison images, one reference/processed pair per eye.
pub struct EyeImagePaths {
    pub reference_left: PathBuf,
    pub reference_right: PathBuf,
    pub processed_left: PathBuf,
    pub processed_right: PathBuf,
}

impl Default for EyeImagePaths {
    fn default() -> Self {
        Self {
            reference_left: PathBuf::from("images/reference_left.ppm"),
            reference_right: PathBuf::from("images/reference_right.ppm"),
            processed_left: PathBuf::from("images/processed_left.ppm"),
            processed_right: PathBuf::from("images/processed_right.ppm"),
        }
    }
}

// Application settings, fixed for the lifetime of the session.
pub struct AppConfig {
    pub images: EyeImagePaths,
    pub window_width: u32,
    pub window_height: u32,
    pub head_tracking: bool,
    pub high_quality: bool,
    pub perf_summary: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            images: EyeImagePaths::default(),
            window_width: DEFAULT_WINDOW_WIDTH,
            window_height: DEFAULT_WINDOW_HEIGHT,
            head_tracking: false,
            high_quality: false,
            perf_summary: true,
        }
    }
}
