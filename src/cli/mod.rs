pub mod args;
pub mod runner;

pub use args::{Args, Command, CommonArgs};
pub use runner::Runner;
