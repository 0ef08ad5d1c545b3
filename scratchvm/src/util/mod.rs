pub mod process;

pub use process::{is_process_alive, is_same_process, kill_process, terminate_process};
