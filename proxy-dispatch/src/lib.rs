pub mod bounce;
pub mod config;
pub mod dispatcher;
pub mod pool;
pub mod session;
pub mod sourcehost;
pub mod stage;
pub mod throttle;

pub use bounce::run_bounce_forwarder;
pub use config::{snapshot_channel, ConfigSnapshot};
pub use dispatcher::{run_reload_loop, Backends, Dispatcher};
pub use pool::{Ack, StageKind, StagePool, WorkerSlot};
pub use session::{IoRecord, PendingRequest, RequestRecord, SessionRecord, SessionState};
pub use sourcehost::{ForwardConfirmSourceHostCheck, ReverseDnsSourceHostCheck};
pub use stage::{io_stage, negotiate_stage, request_stage, StageError};
pub use throttle::DeathThrottle;
