pub mod icons;
pub mod progress;
pub mod report;

pub use progress::{TerminalObserver, format_elapsed};
pub use report::{render_list, render_status};
