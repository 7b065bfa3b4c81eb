//! Single-threaded blocking bridge for the crate's few async calls (the `kube` client).
//!
//! Replaces the teacher's `lazy_static`-based `runtime.rs` with `once_cell`, which is the crate
//! actually declared in the teacher's own `Cargo.toml` (`lazy_static` is not a teacher
//! dependency at all — see DESIGN.md).

use once_cell::sync::Lazy;
use std::future::Future;
use std::sync::Mutex;
use tokio::runtime::{Builder, Runtime};

static TOKIO_RUNTIME: Lazy<Mutex<Runtime>> = Lazy::new(|| {
    Mutex::new(
        Builder::new_current_thread()
            .thread_name("recipe-engine-blocking")
            .enable_all()
            .build()
            .expect("failed to build blocking bridge runtime"),
    )
});

pub fn block_on<F: Future>(future: F) -> F::Output {
    TOKIO_RUNTIME.lock().unwrap().block_on(future)
}
