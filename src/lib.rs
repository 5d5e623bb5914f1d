pub mod cache;
pub mod config;
pub mod graph;
pub mod hash;
pub mod keystore;
pub mod logger;
pub mod memo;
pub mod paths;
pub mod process;
pub mod run;
pub mod sandbox;
pub mod stamp;
pub mod work;

#[cfg(not(windows))]
use jemallocator::Jemalloc;

#[cfg(not(windows))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
