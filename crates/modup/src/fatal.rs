use log::{error, warn};
use modup_core::{FatalErrorHandler, UpdaterError};
use rfd::{MessageButtons, MessageDialog, MessageLevel};
use tokio::sync::mpsc;

/// Hands fatal errors from pipeline tasks to the main thread, which owns the
/// dialog. Native dialogs must not be opened from runtime worker threads.
pub struct ForwardFatal {
    sender: mpsc::UnboundedSender<String>,
}

impl ForwardFatal {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl FatalErrorHandler for ForwardFatal {
    fn on_fatal(&self, error: &UpdaterError) {
        error!("Fatal updater error: {error}");
        if self.sender.send(error.to_string()).is_err() {
            warn!("Fatal error raised after the updater stopped listening");
        }
    }
}

/// Blocks until the user dismisses the dialog. Call from the main thread.
pub fn show_fatal_dialog(message: &str) {
    let _ = MessageDialog::new()
        .set_level(MessageLevel::Error)
        .set_title("Module update failed")
        .set_description(format!(
            "{message}\n\nInstall the missing tool and restart the application."
        ))
        .set_buttons(MessageButtons::Ok)
        .show();
}

#[cfg(test)]
mod tests {
    use modup_core::{FatalErrorHandler, InstallError, UpdaterError};

    use super::ForwardFatal;

    #[test]
    fn fatal_error_reaches_the_receiver() {
        let (handler, mut receiver) = ForwardFatal::channel();

        handler.on_fatal(&UpdaterError::from(InstallError::MissingTool {
            program: "unzip".to_string(),
        }));

        let message = receiver.try_recv().expect("fatal error should be forwarded");
        assert!(message.contains("unzip"));
    }

    #[test]
    fn closed_receiver_does_not_panic() {
        let (handler, receiver) = ForwardFatal::channel();
        drop(receiver);

        handler.on_fatal(&UpdaterError::from(InstallError::MissingTool {
            program: "7z".to_string(),
        }));
    }
}
