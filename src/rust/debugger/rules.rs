// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::glob::glob_match;
use ::serde::{
    Deserialize,
    Serialize,
};
use ::serde_json::Value;

//======================================================================================================================
// Constants
//======================================================================================================================

/// Points in the life of a job where rules are evaluated. Also used as pause reasons.
pub mod site {
    pub const START: u32 = 1;
    pub const TERMINATE: u32 = 2;
    /// Termination of a job that recorded errors.
    pub const TERMINATE_ERRORS: u32 = 4;
    pub const AUTHRECORD: u32 = 8;
    pub const DEBUGTRAP: u32 = 16;
    /// Not a rule site. Pause reason of pauses requested by the client.
    pub const MANUAL: u32 = 32;
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Predicate on one string field of the authentication record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthRecordMatch {
    /// Dot separated path of object keys, array indices are numbers.
    pub path: String,
    pub glob: String,
}

/// Rule installed by a `configure` request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugRule {
    #[serde(default)]
    pub tag: String,
    /// Glob on the main script name.
    pub script: String,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub authrecord: Option<AuthRecordMatch>,
    /// Bitmask of [site] values the rule fires at.
    pub sites: u32,
    /// Attach to the job and pause it.
    #[serde(default)]
    pub connect_on_match: bool,
    /// Only send start and termination notifications.
    #[serde(default)]
    pub inform_start_stop: bool,
}

/// What the rules want done at one site.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RuleHits {
    /// Tags of the rules that asked to connect.
    pub connect: Vec<String>,
    pub inform: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl AuthRecordMatch {
    pub fn matches(&self, record: &Value) -> bool {
        let mut current: &Value = record;
        for key in self.path.split('.').filter(|key| !key.is_empty()) {
            let next: Option<&Value> = match current {
                Value::Object(map) => map.get(key),
                Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            current = match next {
                Some(value) => value,
                None => return false,
            };
        }
        match current {
            Value::String(s) => glob_match(&self.glob, s),
            Value::Number(n) => glob_match(&self.glob, &n.to_string()),
            Value::Bool(b) => glob_match(&self.glob, if *b { "true" } else { "false" }),
            _ => false,
        }
    }
}

impl DebugRule {
    pub fn matches(&self, site: u32, script: &str, auth_record: &Value) -> bool {
        if self.sites & site == 0 || !glob_match(&self.script, script) {
            return false;
        }
        if self.exclude.iter().any(|pattern| glob_match(pattern, script)) {
            return false;
        }
        match &self.authrecord {
            Some(predicate) => predicate.matches(auth_record),
            None => true,
        }
    }
}

impl RuleHits {
    pub fn evaluate(rules: &[DebugRule], site: u32, script: &str, auth_record: &Value) -> Self {
        let mut hits: RuleHits = RuleHits::default();
        for rule in rules.iter().filter(|rule| rule.matches(site, script, auth_record)) {
            if rule.connect_on_match {
                hits.connect.push(rule.tag.clone());
            }
            if rule.inform_start_stop {
                hits.inform = true;
            }
        }
        hits
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        site,
        AuthRecordMatch,
        DebugRule,
        RuleHits,
    };
    use ::anyhow::Result;
    use ::serde_json::{
        json,
        Value,
    };

    fn rule(script: &str, sites: u32) -> DebugRule {
        DebugRule {
            tag: "t".to_string(),
            script: script.to_string(),
            exclude: Vec::new(),
            authrecord: None,
            sites,
            connect_on_match: true,
            inform_start_stop: false,
        }
    }

    #[test]
    fn test_script_glob_and_excludes() -> Result<()> {
        let mut r: DebugRule = rule("mod::app/*", site::START | site::TERMINATE);
        r.exclude.push("*/internal/*".to_string());
        crate::ensure_eq!(r.matches(site::START, "mod::app/main.whscr", &Value::Null), true);
        crate::ensure_eq!(r.matches(site::DEBUGTRAP, "mod::app/main.whscr", &Value::Null), false);
        crate::ensure_eq!(r.matches(site::START, "mod::app/internal/x.whscr", &Value::Null), false);
        crate::ensure_eq!(r.matches(site::START, "mod::other/main.whscr", &Value::Null), false);
        Ok(())
    }

    #[test]
    fn test_auth_record_path() -> Result<()> {
        let record: Value = json!({"user": {"name": "alice", "roles": ["admin", "dev"]}, "uid": 12});
        let predicate = |path: &str, glob: &str| AuthRecordMatch {
            path: path.to_string(),
            glob: glob.to_string(),
        };
        crate::ensure_eq!(predicate("user.name", "al*").matches(&record), true);
        crate::ensure_eq!(predicate("user.roles.1", "dev").matches(&record), true);
        crate::ensure_eq!(predicate("uid", "1?").matches(&record), true);
        crate::ensure_eq!(predicate("user.missing", "*").matches(&record), false);
        crate::ensure_eq!(predicate("user", "*").matches(&record), false);
        Ok(())
    }

    #[test]
    fn test_rule_hits_and_parsing() -> Result<()> {
        let rules: Vec<DebugRule> = serde_json::from_value(json!([
            {"tag": "a", "script": "*", "sites": 1, "connect_on_match": true},
            {"tag": "b", "script": "*.whscr", "sites": 3, "inform_start_stop": true},
        ]))?;
        let hits: RuleHits = RuleHits::evaluate(&rules, site::START, "x.whscr", &Value::Null);
        crate::ensure_eq!(hits.connect, vec!["a".to_string()]);
        crate::ensure_eq!(hits.inform, true);
        let hits: RuleHits = RuleHits::evaluate(&rules, site::TERMINATE, "x.txt", &Value::Null);
        crate::ensure_eq!(hits, RuleHits::default());
        Ok(())
    }
}
