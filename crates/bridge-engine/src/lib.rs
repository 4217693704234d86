pub mod dispatcher;
pub mod running_set;
pub mod runner;
pub mod telemetry;
pub mod watermark;

pub use dispatcher::{DispatchOutcome, SyncDispatcher, SyncDispatcherArgs};
pub use running_set::RunningSet;
pub use runner::{
    AdapterFactory, ConnectionResolver, DefaultAdapterFactory, EnvConnectionResolver, RunnerConfig, SyncOptions,
    SyncRunner, SyncRunnerArgs,
};
pub use telemetry::TelemetryEmitter;
