pub mod edge;
pub mod momentum;
pub mod win_probability;

pub use edge::compute_edges;
pub use momentum::{compute_game_momentum, MomentumSettings};
