//! Worker process management.

mod manager;

pub use manager::{
    BASE_ENV_KEYS, RESERVED_ENV_KEYS, RESERVED_ENV_PREFIX, SpawnConfig, WorkerError, WorkerEvent,
    WorkerExit, WorkerHandle, WorkerManager, is_reserved_env_key,
};
