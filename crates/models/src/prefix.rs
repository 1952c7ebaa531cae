use lazy_static::lazy_static;
use std::collections::HashMap;

lazy_static! {
    // Tokens of the SPK claim chain share its network prefix.
    static ref BUILTIN: HashMap<&'static str, &'static str> = {
        let mut table = HashMap::new();
        table.insert("SPK", "spkcc_");
        table.insert("LARYNX", "spkcc_");
        table.insert("BROCA", "spkcc_");
        table
    };
}

const DEFAULT_PREFIX: &str = "dlux_";

/// Maps a declared token symbol to its derived network prefix.
/// The built-in table is small and fixed; deployments extend it
/// through configuration rather than code.
#[derive(Debug, Clone, Default)]
pub struct PrefixTable {
    overrides: HashMap<String, String>,
}

impl PrefixTable {
    /// Build a table from `TOKEN=prefix_` pairs layered over the built-ins.
    pub fn with_overrides<I, S>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut overrides = HashMap::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (token, prefix) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected TOKEN=prefix_, got {pair:?}"))?;
            overrides.insert(token.to_uppercase(), prefix.to_string());
        }
        Ok(Self { overrides })
    }

    pub fn derive(&self, token: &str) -> String {
        let token = token.to_uppercase();
        if let Some(prefix) = self.overrides.get(&token) {
            return prefix.clone();
        }
        BUILTIN
            .get(token.as_str())
            .copied()
            .unwrap_or(DEFAULT_PREFIX)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spk_chain_tokens_share_a_prefix() {
        let table = PrefixTable::default();
        assert_eq!(table.derive("SPK"), "spkcc_");
        assert_eq!(table.derive("larynx"), "spkcc_");
        assert_eq!(table.derive("BROCA"), "spkcc_");
        assert_eq!(table.derive("DLUX"), "dlux_");
        assert_eq!(table.derive("ANYTHING"), "dlux_");
    }

    #[test]
    fn overrides_layer_over_builtins() {
        let table = PrefixTable::with_overrides(["DUAT=duat_", "spk=other_"]).unwrap();
        assert_eq!(table.derive("DUAT"), "duat_");
        assert_eq!(table.derive("SPK"), "other_");
        assert_eq!(table.derive("BROCA"), "spkcc_");
    }

    #[test]
    fn malformed_override_is_rejected() {
        assert!(PrefixTable::with_overrides(["nonsense"]).is_err());
    }
}
