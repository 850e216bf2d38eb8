//! Grid - point-to-point delivery to named endpoints
//!
//! Endpoints connect under their own id and receive `§PSI` envelopes
//! addressed to them. Messages for an endpoint that is not connected wait in
//! its inbox and are flushed, in order, when it connects. Delivery is
//! at-least-once and FIFO per target.

pub mod envelope;
pub mod router;
pub mod transport;

pub use envelope::{Psi, PSI_PREFIX};
pub use router::{
    Connection, Grid, GridStatus, InboxEntry, SharedGrid, NEXUS_ENDPOINT, SYSTEM_ENDPOINT,
};
