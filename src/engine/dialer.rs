use std::collections::HashMap;
use std::sync::Arc;
use indexmap::IndexMap;
use log::debug;
use phonenumber::{country, Mode};
use regex::Regex;
use crate::config::DialerConfig;
use crate::error::{Error, Result};

/// Value of `client-number-format` that selects phone-number validation.
const PHONE_FORMAT: &str = "phone";

pub enum NumberFormat {
    /// Valid numbers for the region, forwarded in E.164 form.
    Phone { region: country::Id },
    /// Anchored pattern with at most one capture group.
    Pattern(Regex),
}

pub enum DialerAction {
    /// Dialed digits select another dialer by name.
    Switch,
    Client { client: String, format: NumberFormat },
    /// Exact digit strings mapped to `(client, number)`.
    Map(IndexMap<String, (String, String)>),
}

pub struct DialerRule {
    pub name: String,
    pub dial_tone: Vec<f32>,
    pub action: DialerAction,
}

impl DialerRule {
    fn compile(name: &str, config: &DialerConfig) -> Result<Self> {
        let invalid = |reason: String| Error::Config { dialer: name.to_owned(), reason };

        let action = match (&config.client, &config.map) {
            (Some(_), Some(_)) => return Err(invalid("both 'client' and 'map' are set".into())),
            (Some(client), None) => {
                let format = match config.client_number_format.as_deref() {
                    None => return Err(invalid("'client' requires 'client-number-format'".into())),
                    Some(PHONE_FORMAT) => {
                        let region = config.client_number_region.as_deref()
                            .ok_or_else(|| invalid("phone format requires 'client-number-region'".into()))?;
                        let region = region.to_ascii_uppercase().parse::<country::Id>()
                            .map_err(|_| invalid(format!("unknown region '{}'", region)))?;
                        NumberFormat::Phone { region }
                    },
                    Some(pattern) => {
                        let regex = Regex::new(&format!("^(?:{})$", pattern))
                            .map_err(|err| invalid(err.to_string()))?;
                        if regex.captures_len() > 2 {
                            return Err(invalid(format!("pattern '{}' has more than one capture group", pattern)))
                        }
                        NumberFormat::Pattern(regex)
                    }
                };
                DialerAction::Client { client: client.clone(), format }
            },
            (None, Some(map)) => DialerAction::Map(
                map.iter()
                    .map(|(digits, [client, number])| (digits.clone(), (client.clone(), number.clone())))
                    .collect()
            ),
            (None, None) => DialerAction::Switch,
        };

        Ok(Self {
            name: name.to_owned(),
            dial_tone: config.dial_tone.clone(),
            action,
        })
    }

    /// Returns the `(client, number)` to hand off to, if `digits` completes a number.
    pub fn resolve(&self, digits: &str) -> Option<(String, String)> {
        match &self.action {
            DialerAction::Switch => None,
            DialerAction::Map(map) => map.get(digits).cloned(),
            DialerAction::Client { client, format } => {
                let number = match format {
                    NumberFormat::Phone { region } => {
                        let parsed = phonenumber::parse(Some(*region), digits).ok()?;
                        if !phonenumber::is_valid(&parsed) {
                            return None
                        }
                        parsed.format().mode(Mode::E164).to_string()
                    },
                    NumberFormat::Pattern(regex) => {
                        let captures = regex.captures(digits)?;
                        match captures.get(1) {
                            Some(group) => group.as_str().to_owned(),
                            None if regex.captures_len() == 2 => String::new(),
                            None => digits.to_owned(),
                        }
                    }
                };
                Some((client.clone(), number))
            }
        }
    }
}

/// Named dialer rules. Rules are compiled on first use, so a malformed
/// entry only fails when a line actually reaches it.
pub struct DialerTable {
    configs: IndexMap<String, DialerConfig>,
    compiled: HashMap<String, Arc<DialerRule>>,
}

impl DialerTable {
    pub fn new(configs: IndexMap<String, DialerConfig>) -> Self {
        Self {
            configs,
            compiled: HashMap::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.configs.contains_key(name)
    }

    pub fn rule(&mut self, name: &str) -> Result<Arc<DialerRule>> {
        if let Some(rule) = self.compiled.get(name) {
            return Ok(Arc::clone(rule))
        }
        let config = self.configs.get(name).ok_or_else(|| Error::Config {
            dialer: name.to_owned(),
            reason: "no such dialer".into(),
        })?;
        let rule = Arc::new(DialerRule::compile(name, config)?);
        debug!("Compiled dialer '{}'", name);
        self.compiled.insert(name.to_owned(), Arc::clone(&rule));
        Ok(rule)
    }
}
