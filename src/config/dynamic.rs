//! Per-layer dynamic overrides.
//!
//! The override table maps layer-name patterns to either a skip marker or a
//! partial configuration. Keys use the same syntax as checkpoint configs:
//! `-:<regex>` skips matching layers, `+:<regex>` (or a bare regex) applies the
//! attached overrides. Patterns match from the start of the full layer name and
//! the first matching entry wins, so table order is significant.

use std::fmt;

use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::QuantizeConfig;

const SKIP_PREFIX: &str = "-:";
const MATCH_PREFIX: &str = "+:";

/// Partial configuration applied to matching layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bits: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_size: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sym: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc_act: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub damp_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub static_groups: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mse: Option<f32>,
}

impl LayerOverrides {
    fn apply(&self, config: &mut QuantizeConfig) {
        if let Some(bits) = self.bits {
            config.bits = bits;
        }
        if let Some(group_size) = self.group_size {
            config.group_size = group_size;
        }
        if let Some(sym) = self.sym {
            config.sym = sym;
        }
        if let Some(desc_act) = self.desc_act {
            config.desc_act = desc_act;
        }
        if let Some(damp_percent) = self.damp_percent {
            config.damp_percent = damp_percent;
        }
        if let Some(static_groups) = self.static_groups {
            config.static_groups = static_groups;
        }
        if let Some(mse) = self.mse {
            config.mse = mse;
        }
    }
}

impl fmt::Display for LayerOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str("{}"),
        }
    }
}

/// Ordered `pattern -> overrides` table.
///
/// Serialized as a JSON object; entry order is preserved in both directions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DynamicOverrides {
    entries: Vec<(String, LayerOverrides)>,
}

impl DynamicOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule that applies `overrides` to layers matching `pattern`
    pub fn with_override(mut self, pattern: &str, overrides: LayerOverrides) -> Self {
        self.push(format!("{MATCH_PREFIX}{pattern}"), overrides);
        self
    }

    /// Add a rule that skips layers matching `pattern`
    pub fn with_skip(mut self, pattern: &str) -> Self {
        self.push(format!("{SKIP_PREFIX}{pattern}"), LayerOverrides::default());
        self
    }

    /// Append a raw table entry (key in `-:`/`+:` syntax)
    pub fn push(&mut self, key: impl Into<String>, overrides: LayerOverrides) {
        self.entries.push((key.into(), overrides));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LayerOverrides)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for DynamicOverrides {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, overrides) in &self.entries {
            map.serialize_entry(key, overrides)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for DynamicOverrides {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = DynamicOverrides;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of layer name patterns to overrides")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, overrides)) = access.next_entry::<String, LayerOverrides>()? {
                    entries.push((key, overrides));
                }
                Ok(DynamicOverrides { entries })
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(DynamicOverrides::default())
            }
        }

        deserializer.deserialize_any(OrderedVisitor)
    }
}

/// Outcome of resolving one layer against the override table
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    /// Layer is excluded from quantization
    Skip,
    /// Fully owned effective configuration for the layer
    Quantize(Box<QuantizeConfig>),
}

#[derive(Debug)]
enum RuleAction {
    Skip,
    Override(LayerOverrides),
}

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    action: RuleAction,
}

/// Immutable base configuration plus compiled override rules.
///
/// `resolve` produces a deep copy per layer, so tasks are unaffected by any
/// later change to the configuration the resolver was built from.
#[derive(Debug)]
pub struct LayerConfigResolver {
    base: QuantizeConfig,
    rules: Vec<CompiledRule>,
}

impl LayerConfigResolver {
    pub fn new(base: &QuantizeConfig) -> crate::Result<Self> {
        let mut rules = Vec::with_capacity(base.dynamic.len());
        for (key, overrides) in base.dynamic.iter() {
            let (pattern, action) = if let Some(p) = key.strip_prefix(SKIP_PREFIX) {
                (p, RuleAction::Skip)
            } else {
                let p = key.strip_prefix(MATCH_PREFIX).unwrap_or(key);
                (p, RuleAction::Override(overrides.clone()))
            };
            let regex = Regex::new(&format!("^(?:{pattern})"))?;
            rules.push(CompiledRule { regex, action });
        }

        Ok(Self {
            base: base.clone(),
            rules,
        })
    }

    /// Configuration applied when no rule matches
    pub fn base(&self) -> &QuantizeConfig {
        &self.base
    }

    fn matching_rule(&self, layer_name: &str) -> Option<&CompiledRule> {
        self.rules.iter().find(|r| r.regex.is_match(layer_name))
    }

    /// Skip decision and effective configuration for `layer_name`
    pub fn resolve(&self, layer_name: &str) -> Resolved {
        match self.matching_rule(layer_name).map(|r| &r.action) {
            Some(RuleAction::Skip) => Resolved::Skip,
            Some(RuleAction::Override(overrides)) => {
                let mut config = self.base.clone();
                overrides.apply(&mut config);
                Resolved::Quantize(Box::new(config))
            }
            None => Resolved::Quantize(Box::new(self.base.clone())),
        }
    }

    /// Overrides applied to `layer_name`, if any rule with overrides matches
    pub fn overrides_for(&self, layer_name: &str) -> Option<&LayerOverrides> {
        match self.matching_rule(layer_name).map(|r| &r.action) {
            Some(RuleAction::Override(overrides)) => Some(overrides),
            _ => None,
        }
    }

    /// Whether any rule (skip or override) matches `layer_name`
    pub fn has_rule_for(&self, layer_name: &str) -> bool {
        self.matching_rule(layer_name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(dynamic: DynamicOverrides) -> QuantizeConfig {
        QuantizeConfig {
            dynamic,
            ..Default::default()
        }
    }

    #[test]
    fn test_skip_and_override() {
        let dynamic = DynamicOverrides::new()
            .with_skip(r".*\.mlp\.down_proj")
            .with_override(
                r"model\.layers\.1\.",
                LayerOverrides {
                    bits: Some(8),
                    group_size: Some(32),
                    ..Default::default()
                },
            );
        let resolver = LayerConfigResolver::new(&config_with(dynamic)).unwrap();

        assert_eq!(resolver.resolve("model.layers.3.mlp.down_proj"), Resolved::Skip);

        match resolver.resolve("model.layers.1.self_attn.q_proj") {
            Resolved::Quantize(cfg) => {
                assert_eq!(cfg.bits, 8);
                assert_eq!(cfg.group_size, 32);
            }
            Resolved::Skip => panic!("layer should not be skipped"),
        }

        match resolver.resolve("model.layers.2.self_attn.q_proj") {
            Resolved::Quantize(cfg) => assert_eq!(cfg.bits, 4),
            Resolved::Skip => panic!("layer should not be skipped"),
        }
    }

    #[test]
    fn test_first_match_wins_and_anchored_at_start() {
        let dynamic = DynamicOverrides::new()
            .with_override("model", LayerOverrides { bits: Some(2), ..Default::default() })
            .with_skip("model");
        let resolver = LayerConfigResolver::new(&config_with(dynamic)).unwrap();

        assert!(matches!(resolver.resolve("model.x"), Resolved::Quantize(c) if c.bits == 2));
        // not a prefix match
        assert!(!resolver.has_rule_for("lm_head.model"));
    }

    #[test]
    fn test_snapshot_is_independent_of_base() {
        let mut base = QuantizeConfig::default();
        let resolver = LayerConfigResolver::new(&base).unwrap();
        let Resolved::Quantize(snapshot) = resolver.resolve("layer") else {
            panic!("layer should not be skipped");
        };

        base.bits = 8;
        assert_eq!(snapshot.bits, 4);
        assert_eq!(resolver.base().bits, 4);
    }

    #[test]
    fn test_serde_preserves_order() {
        let json = r#"{"-:b.*": {}, "+:a.*": {"bits": 8}, "c": {"sym": false}}"#;
        let table: DynamicOverrides = serde_json::from_str(json).unwrap();
        let keys: Vec<&str> = table.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["-:b.*", "+:a.*", "c"]);

        let encoded = serde_json::to_string(&table).unwrap();
        assert_eq!(encoded, r#"{"-:b.*":{},"+:a.*":{"bits":8},"c":{"sym":false}}"#);
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        let dynamic = DynamicOverrides::new().with_skip("(unclosed");
        assert!(LayerConfigResolver::new(&config_with(dynamic)).is_err());
    }
}
