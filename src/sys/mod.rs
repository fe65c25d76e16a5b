// 🛡️ Every external effect sits behind a trait in `traits`; the rest are host implementations.

pub mod traits;       // Global contracts
pub mod exec;         // Process spawning & redacted command lines
pub mod secrets;      // Memory hygiene (decryption material)
pub mod transfer;     // HTTP downloads & uploads
pub mod git;          // Source control
pub mod credentials;  // Private corpus access
pub mod container;    // Platform containers
pub mod build;        // Configure & compile
pub mod scan;         // Static-analysis tooling
pub mod diag;         // Failed external test reports
pub mod suite;        // Unit & external test suites

#[cfg(test)]
pub mod testing;      // Scripted fakes for the traits above
