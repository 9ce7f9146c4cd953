pub mod codec;
pub mod history;
pub mod interpolate;
pub mod state;

pub use codec::{decode, encode, rotations_equal, transforms_equal};
pub use history::StateHistory;
pub use interpolate::{ApplyContext, apply, interpolate, transform_absolute};
pub use state::{
    ActiveSet, AgentState, PlayerState, StateFrame, TransformState, WalkerState, closest_angle,
    quantize_heading, wrap_angle,
};
