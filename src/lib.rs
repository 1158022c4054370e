pub mod geom;
pub mod scene;
pub mod sim;
mod uid;

// Prelude
pub use geom::point::Point;
pub use geom::triangle::Triangle;
pub use geom::vector::Vector;
pub use scene::{Scene, Surface};
pub use uid::UID;
