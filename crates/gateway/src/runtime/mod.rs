//! Session runtime: turn queue, permission coordinator, tool worker pool,
//! model preflight, tool-result cache, and the session manager that wires
//! them together (§4.2–§4.6).

pub mod cache;
pub mod permission;
pub mod preflight;
pub mod session_manager;
pub mod tool_pool;
pub mod turn_queue;

pub use permission::PermissionCoordinator;
pub use session_manager::SessionManager;
pub use tool_pool::WorkerPool;
