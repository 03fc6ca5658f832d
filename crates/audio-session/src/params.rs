//! `key=value;key=value` parameter strings exchanged with the audio framework.

use crate::format::DeviceMask;

/// Key carrying the output device mask as a decimal integer.
pub const KEY_ROUTING: &str = "routing";

/// Parsed parameter list, in input order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    pairs: Vec<(String, String)>,
}

impl Params {
    /// Parse a `;` separated list. Entries without `=` are kept with an empty value.
    pub fn parse(s: &str) -> Self {
        let pairs = s
            .split(';')
            .map(str::trim)
            .filter(|kv| !kv.is_empty())
            .map(|kv| match kv.split_once('=') {
                Some((k, v)) => (k.trim().to_string(), v.trim().to_string()),
                None => (kv.to_string(), String::new()),
            })
            .collect();
        Self { pairs }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Device mask under [`KEY_ROUTING`], if present and numeric.
    pub fn routing(&self) -> Option<DeviceMask> {
        let raw = self.get(KEY_ROUTING)?;
        match raw.parse::<u32>() {
            Ok(bits) => Some(DeviceMask(bits)),
            Err(_) => {
                tracing::warn!(value = raw, "ignoring non-numeric routing parameter");
                None
            }
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn insert(&mut self, key: &str, value: impl ToString) {
        let value = value.to_string();
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some(pair) => pair.1 = value,
            None => self.pairs.push((key.to_string(), value)),
        }
    }
}

impl std::fmt::Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_routing_and_ignores_blanks() {
        let p = Params::parse("routing=8194; ;foo=bar");
        assert_eq!(p.routing(), Some(DeviceMask(8194)));
        assert_eq!(p.get("foo"), Some("bar"));
        assert_eq!(p.keys().count(), 2);
    }

    #[test]
    fn bad_routing_value_is_ignored() {
        assert_eq!(Params::parse("routing=speaker").routing(), None);
        assert_eq!(Params::parse("volume=3").routing(), None);
    }

    #[test]
    fn display_round_trips_insert_order() {
        let mut p = Params::default();
        p.insert(KEY_ROUTING, 2);
        p.insert("x", "y");
        p.insert(KEY_ROUTING, 4);
        assert_eq!(p.to_string(), "routing=4;x=y");
    }
}
