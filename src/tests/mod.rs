//! Unit tests for the x86_vmx crate.
//!
//! Module-level tests live next to the code; these exercise the crate through its public
//! surface, the way a hypervisor would drive it.
