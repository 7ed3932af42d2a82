use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::Scenario;

/// Insertion-ordered mapping from qualified name to [`Scenario`].
///
/// Keys are unique. Serializes as a JSON object whose members keep insertion
/// order; deserializing an object with a repeated key is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScenarioMap {
    entries: Vec<(String, Scenario)>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("duplicate scenario key '{0}'")]
pub struct DuplicateKey(pub String);

impl ScenarioMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a scenario, rejecting a key that is already present.
    pub fn insert(&mut self, qualified_name: String, scenario: Scenario) -> Result<(), DuplicateKey> {
        if self.contains_key(&qualified_name) {
            return Err(DuplicateKey(qualified_name));
        }
        self.entries.push((qualified_name, scenario));
        Ok(())
    }

    pub fn get(&self, qualified_name: &str) -> Option<&Scenario> {
        self.entries
            .iter()
            .find(|(key, _)| key == qualified_name)
            .map(|(_, scenario)| scenario)
    }

    pub fn contains_key(&self, qualified_name: &str) -> bool {
        self.get(qualified_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Scenario)> {
        self.entries.iter().map(|(key, scenario)| (key.as_str(), scenario))
    }
}

impl Serialize for ScenarioMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, scenario) in &self.entries {
            map.serialize_entry(key, scenario)?;
        }
        map.end()
    }
}

struct ScenarioMapVisitor;

impl<'de> Visitor<'de> for ScenarioMapVisitor {
    type Value = ScenarioMap;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object mapping qualified names to scenarios")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut map = ScenarioMap::new();
        while let Some((key, scenario)) = access.next_entry::<String, Scenario>()? {
            map.insert(key, scenario).map_err(de::Error::custom)?;
        }
        Ok(map)
    }
}

impl<'de> Deserialize<'de> for ScenarioMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(ScenarioMapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(positive: &str) -> Scenario {
        Scenario {
            positive: positive.to_string(),
            negative: String::new(),
            func_source: String::new(),
            file_path: "calc.py".to_string(),
            error: None,
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_key() {
        let mut map = ScenarioMap::new();
        map.insert("add".to_string(), scenario("one")).unwrap();

        let result = map.insert("add".to_string(), scenario("two"));
        assert_eq!(result, Err(DuplicateKey("add".to_string())));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("add").unwrap().positive, "one");
    }

    #[test]
    fn test_serialization_keeps_insertion_order() {
        let mut map = ScenarioMap::new();
        map.insert("zeta".to_string(), scenario("z")).unwrap();
        map.insert("alpha".to_string(), scenario("a")).unwrap();
        map.insert("Calc.mid".to_string(), scenario("m")).unwrap();

        let json = serde_json::to_string(&map).unwrap();
        let zeta = json.find("\"zeta\"").unwrap();
        let alpha = json.find("\"alpha\"").unwrap();
        let mid = json.find("\"Calc.mid\"").unwrap();
        assert!(zeta < alpha && alpha < mid);
    }

    #[test]
    fn test_deserialization_keeps_document_order() {
        let json = r#"{
            "b": {"positive": "pb", "negative": "nb"},
            "a": {"positive": "pa", "negative": "na"}
        }"#;
        let map: ScenarioMap = serde_json::from_str(json).unwrap();
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(map.get("a").unwrap().negative, "na");
    }

    #[test]
    fn test_deserialization_rejects_duplicate_key() {
        let json = r#"{
            "a": {"positive": "1", "negative": "1"},
            "a": {"positive": "2", "negative": "2"}
        }"#;
        let result: Result<ScenarioMap, _> = serde_json::from_str(json);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("duplicate scenario key 'a'"), "{err}");
    }

    #[test]
    fn test_array_is_not_a_scenario_map() {
        let result: Result<ScenarioMap, _> = serde_json::from_str("[]");
        assert!(result.is_err());
    }
}
