pub mod session;

pub use session::{QuotaExceeded, Session, SessionFilter, SessionUpdate};
