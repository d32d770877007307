//! Common utilities shared by all layers.

/// A wrapper for values that have passed validation.  Routines that assume
/// their input is well-formed take a `Valid<T>` so the obligation to check
/// is visible in the type.
#[derive(Clone, Debug)]
pub struct Valid<T>(pub T);

/// Wrap a value without validating it.  For inputs that are trusted by
/// construction (e.g. programs built programmatically by tests).
pub fn skip_validation<T>(t: T) -> Valid<T> {
    Valid(t)
}
