use std::collections::BTreeMap;

use crate::config::EnvironmentConfig;

/// Environment handed to plug-in processes.
///
/// Children never see the raw host environment: it is filtered through
/// the configured `unset` list and extended with `set` once, when the
/// manager is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environ {
    vars: BTreeMap<String, String>,
}

impl Environ {
    pub fn from_config(config: &EnvironmentConfig) -> Self {
        let inherited: Vec<(String, String)> = if config.inherit {
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect()
        } else {
            Vec::new()
        };

        Self::build(inherited, config)
    }

    fn build(inherited: Vec<(String, String)>, config: &EnvironmentConfig) -> Self {
        let mut vars: BTreeMap<String, String> = inherited
            .into_iter()
            .filter(|(k, _)| !config.unset.contains(k))
            .collect();

        for (k, v) in &config.set {
            vars.insert(k.clone(), v.clone());
        }

        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_then_set() {
        let config = EnvironmentConfig {
            inherit: true,
            set: BTreeMap::from([("LANG".to_string(), "C".to_string())]),
            unset: vec!["DISPLAY".to_string(), "LANG".to_string()],
        };
        let inherited = vec![
            ("DISPLAY".to_string(), ":0".to_string()),
            ("HOME".to_string(), "/home/u".to_string()),
            ("LANG".to_string(), "de_DE".to_string()),
        ];

        let env = Environ::build(inherited, &config);
        assert_eq!(env.get("DISPLAY"), None);
        assert_eq!(env.get("HOME"), Some("/home/u"));
        assert_eq!(env.get("LANG"), Some("C"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn test_no_inherit() {
        let config = EnvironmentConfig {
            inherit: false,
            ..EnvironmentConfig::default()
        };
        assert!(Environ::from_config(&config).is_empty());
    }
}
