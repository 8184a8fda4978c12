//! Architecture-specific context switching
//!
//! Each backend provides the same surface:
//!
//! - `SavedRegs` - callee-saved register block for a suspended context
//! - `init_context` - prepare a fresh context that runs `entry(arg)` on its
//!   own stack and, when `entry` returns, resumes a link context
//! - `context_switch` - save current registers into one block, load another

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
    }
}
