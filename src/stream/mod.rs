//! Stream combinators for the presentation side of the link

mod coalesce;

pub use coalesce::{Coalesce, CoalesceExt};
