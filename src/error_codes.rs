//! Meridian error codes
//!
//! Error codes follow the pattern: MER-{CATEGORY}-{3-digit number}
//!
//! Categories:
//! - PRS: Parser-related failures (one file, never fatal for a run)
//! - GRF: Graph identity and snapshot errors
//! - STO: Storage backend errors
//! - VCS: Version-control subprocess errors
//! - QRY: Query-layer errors
//! - CFG: Configuration errors
//! - IO: Filesystem errors
//!
//! Each error code is stable and should not be reused.

/// Parser returned a failure for one file
pub const MER_PRS_001_PARSE_FAILURE: &str = "MER-PRS-001";

/// Node id already exists with a different label
pub const MER_GRF_001_IDENTITY_CONFLICT: &str = "MER-GRF-001";

/// Edge endpoint missing from the graph
pub const MER_GRF_002_DANGLING_EDGE: &str = "MER-GRF-002";

/// Global phase aborted before its snapshot could be swapped in
pub const MER_GRF_003_SNAPSHOT_SWAP: &str = "MER-GRF-003";

/// Storage backend unreachable
pub const MER_STO_001_CONNECTION: &str = "MER-STO-001";

/// Too many write failures inside one mutation unit
pub const MER_STO_002_THRESHOLD_EXCEEDED: &str = "MER-STO-002";

/// External subprocess exceeded its timeout
pub const MER_VCS_001_TIMEOUT: &str = "MER-VCS-001";

/// External subprocess exited unsuccessfully
pub const MER_VCS_002_COMMAND_FAILED: &str = "MER-VCS-002";

/// Ref argument rejected by the allow-list
pub const MER_VCS_003_INVALID_REF: &str = "MER-VCS-003";

/// Raw query rejected (write keyword, too long, bad parameters)
pub const MER_QRY_001_REJECTED: &str = "MER-QRY-001";

/// Symbol not found
pub const MER_QRY_002_SYMBOL_NOT_FOUND: &str = "MER-QRY-002";

/// Invalid configuration value
pub const MER_CFG_001_INVALID: &str = "MER-CFG-001";

/// File could not be read
pub const MER_IO_001_READ_FAILED: &str = "MER-IO-001";

/// Error code documentation
///
/// | Code | Description | Remediation |
/// |------|-------------|-------------|
/// | MER-PRS-001 | Parse failure | File keeps its previous graph data; fix the source and save again |
/// | MER-GRF-001 | Identity conflict | Two records claim one id with different labels; check the parser output |
/// | MER-GRF-002 | Dangling edge | Edge endpoint was pruned; re-run a full build |
/// | MER-GRF-003 | Snapshot swap aborted | Previous snapshot retained; inspect the phase error |
/// | MER-STO-001 | Storage unreachable | Check the backend connection |
/// | MER-STO-002 | Threshold exceeded | Unit rolled back; inspect backend write errors |
/// | MER-VCS-001 | Subprocess timeout | Derived analysis skipped this run; raise `vcs.timeout_secs` |
/// | MER-VCS-002 | Subprocess failed | Check that the root is a git repository |
/// | MER-VCS-003 | Invalid ref | Use a branch, tag or commit name without a leading dash |
/// | MER-QRY-001 | Query rejected | Read-only statements only, within the length cap |
/// | MER-QRY-002 | Symbol not found | Search by name first |
/// | MER-CFG-001 | Invalid config | Fix the value in meridian.json or the environment |
/// | MER-IO-001 | Read failed | Check file permissions |
pub fn remediation(code: &str) -> Option<&'static str> {
    match code {
        MER_PRS_001_PARSE_FAILURE => Some("fix the source file; its previous graph data is kept"),
        MER_GRF_001_IDENTITY_CONFLICT => Some("two records share one id with different labels"),
        MER_GRF_002_DANGLING_EDGE => Some("re-run a full build"),
        MER_GRF_003_SNAPSHOT_SWAP => Some("previous snapshot retained; inspect the phase error"),
        MER_STO_001_CONNECTION => Some("check the storage backend connection"),
        MER_STO_002_THRESHOLD_EXCEEDED => Some("unit rolled back; inspect backend write errors"),
        MER_VCS_001_TIMEOUT => Some("raise vcs.timeout_secs"),
        MER_VCS_002_COMMAND_FAILED => Some("check that the root is a git repository"),
        MER_VCS_003_INVALID_REF => Some("use a branch, tag or commit name"),
        MER_QRY_001_REJECTED => Some("read-only statements only"),
        MER_QRY_002_SYMBOL_NOT_FOUND => Some("search by name first"),
        MER_CFG_001_INVALID => Some("fix meridian.json or the MERIDIAN_* environment"),
        MER_IO_001_READ_FAILED => Some("check file permissions"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_pattern() {
        let codes = [
            MER_PRS_001_PARSE_FAILURE,
            MER_GRF_001_IDENTITY_CONFLICT,
            MER_GRF_002_DANGLING_EDGE,
            MER_GRF_003_SNAPSHOT_SWAP,
            MER_STO_001_CONNECTION,
            MER_STO_002_THRESHOLD_EXCEEDED,
            MER_VCS_001_TIMEOUT,
            MER_VCS_002_COMMAND_FAILED,
            MER_VCS_003_INVALID_REF,
            MER_QRY_001_REJECTED,
            MER_QRY_002_SYMBOL_NOT_FOUND,
            MER_CFG_001_INVALID,
            MER_IO_001_READ_FAILED,
        ];
        for code in codes {
            assert!(code.starts_with("MER-"), "{}", code);
            assert!(remediation(code).is_some(), "{} has no remediation", code);
        }
    }

    #[test]
    fn test_unknown_code_has_no_remediation() {
        assert!(remediation("MER-XXX-999").is_none());
    }
}
