//! Managed block in `/etc/hosts`
//!
//! nodeup keeps the records it receives from kops-controller between two marker
//! lines and never touches anything outside them:
//!
//! ```text
//! 127.0.0.1	localhost
//!
//! # Begin host entries managed by kops - do not edit
//! 10.0.0.2	api.internal.c1.example.com kops-controller.internal.c1.example.com
//! # End host entries managed by kops
//! ```

mod error;
mod hostmap;
mod update;

pub use error::{HostsError, Result};
pub use hostmap::HostMap;
pub use update::{split_guarded_block, update, MAX_WRITE_ATTEMPTS};

/// First line of the managed block
pub const BEGIN_MARKER: &str = "# Begin host entries managed by kops - do not edit";
/// Last line of the managed block
pub const END_MARKER: &str = "# End host entries managed by kops";
