use crate::{MAX_PART_SIZE, MIB, TransferError};

/// Validates a vault name: 1 to 255 characters drawn from `A-Z`, `a-z`,
/// `0-9`, `_`, `-` and `.`.
pub fn validate_vault_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidVaultName("empty name".into()));
    }

    if name.len() > 255 {
        return Err(TransferError::InvalidVaultName(format!(
            "name longer than 255 characters: {name}"
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(TransferError::InvalidVaultName(format!(
            "character {c:?} not allowed: {name}"
        )));
    }

    Ok(())
}

/// Validates a multipart part size.
///
/// Parts must be 1 MiB times a power of two so that combining the part
/// roots yields the whole-archive root.
pub fn validate_part_size(size: u64) -> Result<(), TransferError> {
    if size < MIB || size > MAX_PART_SIZE || size % MIB != 0 || !(size / MIB).is_power_of_two() {
        return Err(TransferError::InvalidPartSize(size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(validate_vault_name("").is_err());
    }

    #[test]
    fn rejects_long_name() {
        assert!(validate_vault_name(&"a".repeat(256)).is_err());
        assert!(validate_vault_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn rejects_disallowed_characters() {
        assert!(validate_vault_name("photos/2024").is_err());
        assert!(validate_vault_name("my vault").is_err());
        assert!(validate_vault_name("café").is_err());
    }

    #[test]
    fn accepts_typical_names() {
        assert!(validate_vault_name("examplevault").is_ok());
        assert!(validate_vault_name("backup_2024-01.daily").is_ok());
    }

    #[test]
    fn accepts_power_of_two_part_sizes() {
        for n in 0..=12 {
            assert!(validate_part_size(MIB << n).is_ok(), "1 MiB << {n}");
        }
    }

    #[test]
    fn rejects_bad_part_sizes() {
        assert!(validate_part_size(0).is_err());
        assert!(validate_part_size(MIB / 2).is_err());
        assert!(validate_part_size(3 * MIB).is_err());
        assert!(validate_part_size(MIB + 1).is_err());
        assert!(validate_part_size(MAX_PART_SIZE * 2).is_err());
    }
}
