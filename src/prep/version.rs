use semver::Version;

use crate::error::IbuError;

/// Forward-only upgrade gate: the seed version must be strictly greater than
/// the current cluster version.
pub fn check_upgrade(seed_version: &str, current_version: &str) -> Result<(), IbuError> {
    let seed = parse("seed", seed_version)?;
    let current = parse("current cluster", current_version)?;

    if seed <= current {
        return Err(IbuError::UpgradeNotPossible(format!(
            "seed version {seed_version} must be greater than current cluster version {current_version}"
        )));
    }
    Ok(())
}

fn parse(which: &str, version: &str) -> Result<Version, IbuError> {
    Version::parse(version.trim())
        .map_err(|e| IbuError::InvalidVersion(format!("{which} version {version:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_seed_passes() {
        check_upgrade("4.14.1", "4.13.0").unwrap();
        check_upgrade("4.13.1", "4.13.0").unwrap();
        check_upgrade("4.14.0", "4.14.0-rc.3").unwrap();
    }

    #[test]
    fn test_older_seed_rejected() {
        let err = check_upgrade("4.12.1", "4.13.0").unwrap_err();
        assert!(matches!(err, IbuError::UpgradeNotPossible(_)));
        let msg = err.to_string();
        assert!(msg.contains("4.12.1"));
        assert!(msg.contains("4.13.0"));
    }

    #[test]
    fn test_equal_version_rejected() {
        assert!(matches!(
            check_upgrade("4.13.0", "4.13.0"),
            Err(IbuError::UpgradeNotPossible(_))
        ));
    }

    #[test]
    fn test_parse_failure_names_the_version() {
        let err = check_upgrade("4.14", "4.13.0").unwrap_err();
        assert!(matches!(err, IbuError::InvalidVersion(_)));
        assert!(err.to_string().contains("seed version \"4.14\""));

        let err = check_upgrade("4.14.1", "latest").unwrap_err();
        assert!(err.to_string().contains("current cluster version \"latest\""));
    }
}
