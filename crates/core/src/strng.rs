//! Cheap clone-able strings for names and keys that are copied on every
//! connection (service keys, routing keys, hostnames).

use arcstr::ArcStr;

pub type Strng = ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	ArcStr::from(s.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn clones_share_storage() {
		let a = new("apps/web");
		let b = a.clone();
		assert_eq!(a, b);
		assert_eq!(a.as_ptr(), b.as_ptr());
	}
}
