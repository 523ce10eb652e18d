//! Domain types shared between models, metrics and callers.

pub mod mapping;

pub use mapping::CharacterMapping;
