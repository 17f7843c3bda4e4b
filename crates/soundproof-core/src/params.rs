//! Parameter metadata.

use crate::PARAM_NAME_MAX;

/// Metadata for one device parameter.
///
/// Lives in the device's shared param-info table, so it is fixed-size and
/// `Copy`. The `id` is the plugin-native parameter id (a `clap_id` for CLAP
/// plugins); the table index is what the client API calls a [`ParamIdx`].
///
/// [`ParamIdx`]: crate::ids::ParamIdx
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ParamInfo {
    pub id: u32,
    pub flags: u32,
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
    name_len: u32,
    name: [u8; PARAM_NAME_MAX],
}

impl ParamInfo {
    #[must_use]
    pub fn new(id: u32, name: &str, min_value: f64, max_value: f64, default_value: f64) -> Self {
        let mut stored = [0u8; PARAM_NAME_MAX];
        // Truncate on a char boundary so the stored prefix stays valid UTF-8.
        let mut len = name.len().min(PARAM_NAME_MAX);
        while len > 0 && !name.is_char_boundary(len) {
            len -= 1;
        }
        stored[..len].copy_from_slice(&name.as_bytes()[..len]);
        Self {
            id,
            flags: 0,
            min_value,
            max_value,
            default_value,
            name_len: len as u32,
            name: stored,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        let len = (self.name_len as usize).min(PARAM_NAME_MAX);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

impl Default for ParamInfo {
    fn default() -> Self {
        Self::new(u32::MAX, "", 0.0, 1.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let info = ParamInfo::new(7, "Cutoff", 0.0, 1.0, 0.5);
        assert_eq!(info.name(), "Cutoff");
        assert_eq!(info.id, 7);
    }

    #[test]
    fn test_long_name_truncates_on_char_boundary() {
        let long = "é".repeat(PARAM_NAME_MAX); // 2 bytes per char
        let info = ParamInfo::new(0, &long, 0.0, 1.0, 0.0);
        assert!(info.name().len() <= PARAM_NAME_MAX);
        assert!(info.name().chars().all(|c| c == 'é'));
    }
}
