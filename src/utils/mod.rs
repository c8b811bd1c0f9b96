pub mod bitfield;
pub mod lock_free_stack;
pub mod stack;
pub mod weak_random;

fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    let mut value = std::env::var(var).ok()?;
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value.pop();
    }

    let factor = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => 1024 * 1024 * 1024,
        b'm' | b'M' => 1024 * 1024,
        b'k' | b'K' => 1024,
        _ => 1,
    };
    if factor != 1 {
        value.pop();
    }

    value.trim().parse::<f64>().ok().map(|x| (x, factor))
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;

    Some(value as usize * factor)
}

pub fn read_string_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    match read_string_from_env(var)?.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_values_with_size_suffix() {
        std::env::set_var("RSMARK_TEST_UINT", "4k");
        assert_eq!(read_uint_from_env("RSMARK_TEST_UINT"), Some(4096));
        std::env::set_var("RSMARK_TEST_UINT", "2MB");
        assert_eq!(read_uint_from_env("RSMARK_TEST_UINT"), Some(2 * 1024 * 1024));
        std::env::set_var("RSMARK_TEST_UINT", "17");
        assert_eq!(read_uint_from_env("RSMARK_TEST_UINT"), Some(17));
        std::env::set_var("RSMARK_TEST_BOOL", "Off");
        assert_eq!(read_bool_from_env("RSMARK_TEST_BOOL"), Some(false));
        assert_eq!(read_uint_from_env("RSMARK_TEST_MISSING"), None);
    }
}
