//! Checkpointing and model export.
//!
//! Provides:
//! - `Checkpointable` trait for components that can be saved/restored
//! - `CheckpointManager` for rotating `checkpoint_iter_NNNNNN/` directories
//! - `save_pretrained` for the final policy + vocabulary artifact

mod manager;
mod state;

pub use manager::{CheckpointConfig, CheckpointManager};
pub use state::{
    load_var_map, save_pretrained, Checkpointable, TrainerState, MODEL_FILE, STATE_FILE,
    VOCAB_FILE,
};
