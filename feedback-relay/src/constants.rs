//! Page-specific constants: URLs, selectors, sentinel labels and timeouts.

use std::time::Duration;

use crate::storage::StorageScope;

pub const SETTINGS_STORAGE: StorageScope = StorageScope::Local;
pub const CONTEXT_URL_MAP_STORAGE: StorageScope = StorageScope::Session;

/// Region whose rendered entries confirm that a write took effect.
pub const VERIFICATION_QUERY_SELECTOR: &str = "div[data-block-turn-id]";
pub const OTHER_TASK_NAME: &str = "Other";
pub const NON_OTHER_TASK_SIGNATURE: &str = "X";

pub mod qa_feedback {
    use crate::storage::StorageScope;

    pub const URL: &str = "https://www.multimango.com/qa-feedback";

    pub mod capture {
        use super::StorageScope;

        pub const DOWNLOAD: bool = true;
        pub const OPEN_SAVE_AS_DIALOG: bool = true;
        pub const DEFAULT_FILE_NAME: &str = "qa-feedback";
        pub const USE_TIME_STAMP: bool = true;
        pub const STORAGE: StorageScope = StorageScope::Session;
    }

    pub mod ratings {
        pub const INPUT_QUERY_SELECTOR: &str = "input[type='number']";
    }
}

pub mod tasks {
    pub const MULTIMANGO_URL: &str = "https://www.multimango.com/tasks/*";
    pub const MULTIMANGO_PREFIX: &str = "https://www.multimango.com/tasks/";
    pub const HANDSHAKE_URL: &str = "https://ai.joinhandshake.com/annotations/fellow/task/*/run";
    pub const HANDSHAKE_PREFIX: &str = "https://ai.joinhandshake.com/annotations/fellow/task/";
    pub const OPTIONS_QUERY_SELECTOR: &str = "button[aria-pressed]";
    pub const SUBMIT_BTN_QUERY_SELECTOR: &str = "button[aria-label='Submit']";
    pub const SLUG_INPUT_QUERY_SELECTOR: &str = "textarea";
}

pub mod est_time {
    /// Option buttons shown on the time-limit section before task options appear.
    pub const NUM_NON_TASK_BUTTONS: usize = 3;
    pub const CONTINUE_BTN_QUERY_SELECTOR: &str = "button[aria-label='Continue']";
}

pub mod timeouts {
    use std::time::Duration;

    pub const PAGE_LOAD: Duration = Duration::from_secs(10);
    pub const MSG: Duration = Duration::from_secs(300);
    pub const SCREENSHOT: Duration = Duration::from_secs(10);
    pub const RUN: Duration = Duration::from_secs(600);
    pub const NOTIFICATION: Duration = Duration::from_secs(5);
}

pub const SUCCESS_NOTICE: &str = "Extension Succeeded";
pub const FAILURE_NOTICE: &str = "Extension Failed";

/// Interval between bridge reconnect checks while waiting for the extension.
pub const BRIDGE_CONNECT_POLL: Duration = Duration::from_millis(500);
