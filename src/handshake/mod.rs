//! Login handshakes run on top of a bridge before plain relaying starts

pub mod cipher;
pub mod jwt;
pub mod mcbe;
pub mod palette;
pub mod pro;
pub mod srp;

pub use mcbe::{ClientIdentity, McbeHandshake, McbePhase};
pub use palette::{BlockPalette, TypeRegistry};
pub use pro::{ProOutput, ProPhase, ProSession, SrpMaterial};
