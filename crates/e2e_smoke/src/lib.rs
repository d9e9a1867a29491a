//! Cross-crate smoke tests; see `tests/`.
