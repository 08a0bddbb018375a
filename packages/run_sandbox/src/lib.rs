//! Run Sandbox - single-shot program execution with streamed output
//!
//! This crate runs one snippet of source code through a language toolchain and
//! streams what it prints. It has no HTTP dependencies and no knowledge of rooms
//! or sessions; callers decide which toolchains exist and where output goes.
//!
//! Every job gets a fresh scratch directory, a cleared environment, a closed
//! stdin and its own process group, so a deadline kill takes the whole tree down.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use run_sandbox::{JobEvent, JobSpec, Toolchain};
//!
//! #[tokio::main]
//! async fn main() {
//!     let spec = JobSpec {
//!         toolchain: Toolchain::new("main.py", ["python3", "-u", "main.py"]),
//!         code: "print('hello')".to_string(),
//!         timeout: Duration::from_secs(5),
//!         max_output_bytes: 64 * 1024,
//!         sandbox_prefix: Vec::new(),
//!     };
//!
//!     let mut job = run_sandbox::spawn(spec).await.unwrap();
//!     while let Some(event) = job.next_event().await {
//!         match event {
//!             JobEvent::Output { stream, chunk } => print!("[{stream}] {chunk}"),
//!             JobEvent::Exited(exit) => println!("exit {} (timed out: {})", exit.code, exit.timed_out),
//!             JobEvent::Failed(reason) => println!("failed: {reason}"),
//!         }
//!     }
//! }
//! ```

mod decoder;
mod error;
mod job;
mod toolchain;

pub use decoder::Utf8StreamDecoder;
pub use error::SandboxError;
pub use job::{
    JobEvent, JobExit, JobHandle, JobSpec, OutputStream, TIMED_OUT_EXIT_CODE, TRUNCATION_NOTICE,
    spawn,
};
pub use toolchain::Toolchain;
