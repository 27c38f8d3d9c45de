mod commands;
mod paths;
mod platform;

pub use commands::{HideWindow, background_command};
pub use paths::{AppPaths, AppPathsError, ModulePaths};
pub use platform::Platform;
