//! CLI command implementations.
//!
//! | Module     | Commands handled                                      |
//! |------------|-------------------------------------------------------|
//! | `workflow` | `Start`, `Resume`, `Status`, `List`, `Delete`, `Clean` |
//! | `config`   | `Config`                                              |

pub mod config;
pub mod workflow;

pub use config::cmd_config;
pub use workflow::{cmd_clean, cmd_delete, cmd_list, cmd_resume, cmd_start, cmd_status};
