//! Cheaply clonable, immutable strings for configuration-lived values.

pub use arcstr::{ArcStr as Strng, format, literal};

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	Strng::from(s.as_ref())
}
