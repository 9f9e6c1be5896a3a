//! Builtin in-process agents
//!
//! A small set of self-contained agents used by the sample configuration
//! and the integration tests: a calculator, a lexical search over an
//! in-memory corpus, a data processor, and a canned weather report. They
//! exercise the full pipeline without any external service.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use super::in_process::AgentFn;
use crate::types::{AgentError, JsonMap};

/// Minimum lexical relevance for a search hit to be returned.
const SEARCH_RELEVANCE_FLOOR: f64 = 0.10;

/// Name-keyed catalog of in-process agent functions.
pub struct BuiltinCatalog {
    bindings: HashMap<String, AgentFn>,
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        let mut catalog = Self {
            bindings: HashMap::new(),
        };
        catalog.register_sync("calculator", calculator);
        catalog.register_sync("search", search);
        catalog.register_sync("data_processor", data_processor);
        catalog.register_sync("weather", weather);
        catalog
    }
}

impl BuiltinCatalog {
    pub fn empty() -> Self {
        Self {
            bindings: HashMap::new(),
        }
    }

    /// Bind an async agent function under `name`.
    pub fn register(&mut self, name: &str, func: AgentFn) {
        self.bindings.insert(name.to_string(), func);
    }

    /// Bind a synchronous function under `name`.
    pub fn register_sync(
        &mut self,
        name: &str,
        func: fn(&JsonMap) -> Result<Value, AgentError>,
    ) {
        use futures::FutureExt;
        self.bindings.insert(
            name.to_string(),
            Arc::new(move |input: JsonMap| async move { func(&input) }.boxed()),
        );
    }

    pub fn get(&self, name: &str) -> Option<AgentFn> {
        self.bindings.get(name).cloned()
    }
}

fn query_of(input: &JsonMap) -> &str {
    input.get("query").and_then(|v| v.as_str()).unwrap_or("")
}

/// Pull numbers out of free text, e.g. `"add the digits 5,8"` → `[5, 8]`.
fn numbers_in(text: &str) -> Vec<f64> {
    let re = regex::Regex::new(r"-?\d+(?:\.\d+)?").unwrap();
    re.find_iter(text)
        .filter_map(|m| m.as_str().parse().ok())
        .collect()
}

fn infer_operation(query: &str) -> &'static str {
    let q = query.to_lowercase();
    if q.contains("divide") || q.contains("divided") || q.contains('/') {
        "divide"
    } else if q.contains("multiply") || q.contains("times") || q.contains("product") {
        "multiply"
    } else if q.contains("subtract") || q.contains("minus") || q.contains("difference") {
        "subtract"
    } else {
        // add / plus / sum / digits all reduce to addition
        "add"
    }
}

/// Arithmetic over `operands`, falling back to numbers found in the query.
fn calculator(input: &JsonMap) -> Result<Value, AgentError> {
    let operands: Vec<f64> = match input.get("operands").and_then(|v| v.as_array()) {
        Some(values) => values.iter().filter_map(|v| v.as_f64()).collect(),
        None => numbers_in(query_of(input)),
    };
    if operands.is_empty() {
        return Err(AgentError::permanent("no operands in request"));
    }

    let operation = input
        .get("operation")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| infer_operation(query_of(input)).to_string());

    let mut iter = operands.iter().copied();
    let first = iter.next().unwrap_or(0.0);
    let result = match operation.as_str() {
        "add" => operands.iter().sum(),
        "subtract" => iter.fold(first, |acc, v| acc - v),
        "multiply" => operands.iter().product(),
        "divide" => {
            let mut acc = first;
            for v in iter {
                if v == 0.0 {
                    return Err(AgentError::permanent("division by zero"));
                }
                acc /= v;
            }
            acc
        }
        other => {
            return Err(AgentError::permanent(format!(
                "unsupported operation '{}'",
                other
            )))
        }
    };

    if !result.is_finite() {
        return Err(AgentError::permanent("arithmetic produced a non-finite result"));
    }

    Ok(json!({
        "operation": operation,
        "operands": operands,
        "result": result,
    }))
}

const CORPUS: &[(&str, &str)] = &[
    (
        "Introduction to Machine Learning",
        "Machine learning studies algorithms that improve through experience; \
         supervised learning fits models to labeled training data.",
    ),
    (
        "Sourdough Baking Basics",
        "A healthy starter, patient fermentation and a hot oven are the keys \
         to an open sourdough crumb.",
    ),
    (
        "Pruning Fruit Trees",
        "Winter pruning shapes the tree; summer pruning restrains vigor and \
         lets light reach ripening fruit.",
    ),
    (
        "A History of the Offside Rule",
        "Football's offside law has changed repeatedly since 1863, each time \
         redrawing the line between attack and defence.",
    ),
    (
        "Reading a Balance Sheet",
        "Assets, liabilities and equity must balance; working capital hints \
         at short-term resilience.",
    ),
];

fn tokenize(text: &str) -> Vec<String> {
    const STOPWORDS: &[&str] = &[
        "a", "an", "and", "for", "in", "of", "on", "or", "search", "the", "to", "find", "about",
    ];
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(|t| t.to_string())
        .collect()
}

/// Share of query tokens present in the document.
fn relevance(query_tokens: &[String], doc: &str) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens = tokenize(doc);
    let hits = query_tokens
        .iter()
        .filter(|t| doc_tokens.contains(t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

/// Lexical search over the in-memory corpus, low-relevance hits filtered.
fn search(input: &JsonMap) -> Result<Value, AgentError> {
    let query = query_of(input);
    let max_results = input
        .get("max_results")
        .and_then(|v| v.as_u64())
        .unwrap_or(5) as usize;

    let query_tokens = tokenize(query);
    let mut hits: Vec<(f64, &str, &str)> = CORPUS
        .iter()
        .map(|(title, text)| {
            let score = relevance(&query_tokens, &format!("{} {}", title, text));
            (score, *title, *text)
        })
        .filter(|(score, _, _)| *score >= SEARCH_RELEVANCE_FLOOR)
        .collect();
    hits.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(max_results);

    let results: Vec<Value> = hits
        .iter()
        .map(|(score, title, text)| {
            json!({
                "title": title,
                "snippet": text,
                "relevance": (score * 100.0).round() / 100.0,
            })
        })
        .collect();

    Ok(json!({
        "query": query,
        "count": results.len(),
        "results": results,
    }))
}

/// Count / sum / average over the `data` array.
fn data_processor(input: &JsonMap) -> Result<Value, AgentError> {
    let data = input
        .get("data")
        .and_then(|v| v.as_array())
        .ok_or_else(|| AgentError::permanent("missing 'data' array"))?;
    let operation = input
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or("count");

    let numbers: Vec<f64> = data.iter().filter_map(|v| v.as_f64()).collect();
    let result = match operation {
        "count" => json!(data.len()),
        "sum" => json!(numbers.iter().sum::<f64>()),
        "average" => {
            if numbers.is_empty() {
                return Err(AgentError::permanent("cannot average an empty data set"));
            }
            json!(numbers.iter().sum::<f64>() / numbers.len() as f64)
        }
        other => {
            return Err(AgentError::permanent(format!(
                "unsupported operation '{}'",
                other
            )))
        }
    };

    Ok(json!({
        "operation": operation,
        "count": data.len(),
        "result": result,
    }))
}

fn location_of(input: &JsonMap) -> Option<String> {
    if let Some(loc) = input.get("location").and_then(|v| v.as_str()) {
        return Some(loc.to_string());
    }
    let re = regex::Regex::new(r"(?i)weather\s+(?:of|in|for|at)\s+([A-Za-z][A-Za-z ,]*)").unwrap();
    let captured = re.captures(query_of(input))?.get(1)?.as_str();
    // Cut multi-intent tails: "London, UK and add the digits" → "London, UK"
    let trimmed = captured
        .split(" and ")
        .next()
        .unwrap_or(captured)
        .trim()
        .trim_end_matches(',');
    Some(trimmed.to_string())
}

/// Deterministic canned weather report keyed on the location name.
fn weather(input: &JsonMap) -> Result<Value, AgentError> {
    let location =
        location_of(input).ok_or_else(|| AgentError::permanent("no location in request"))?;

    const CONDITIONS: &[&str] = &["clear", "partly cloudy", "overcast", "light rain"];
    let seed: u64 = location.bytes().map(u64::from).sum();
    let temperature_c = 8 + (seed % 18) as i64;
    let conditions = CONDITIONS[(seed as usize) % CONDITIONS.len()];

    Ok(json!({
        "location": location,
        "temperature_c": temperature_c,
        "conditions": conditions,
        "humidity_pct": 40 + (seed % 45),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input_from(value: Value) -> JsonMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_calculator_explicit_operands() {
        let out = calculator(&input_from(json!({
            "query": "calculate 15 + 27",
            "operation": "add",
            "operands": [15, 27]
        })))
        .unwrap();
        assert_eq!(out["result"], json!(42.0));
    }

    #[test]
    fn test_calculator_extracts_numbers_from_query() {
        let out = calculator(&input_from(json!({
            "query": "current weather of London, UK and add the digits 5,8"
        })))
        .unwrap();
        assert_eq!(out["result"], json!(13.0));
        assert_eq!(out["operation"], json!("add"));
    }

    #[test]
    fn test_calculator_division_by_zero() {
        let err = calculator(&input_from(json!({
            "query": "divide 10 by 0",
            "operation": "divide",
            "operands": [10, 0]
        })))
        .unwrap_err();
        assert!(err.message.contains("division by zero"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_calculator_no_operands() {
        assert!(calculator(&input_from(json!({"query": "calculate"}))).is_err());
    }

    #[test]
    fn test_search_filters_low_relevance() {
        let out = search(&input_from(json!({"query": "search for machine learning"}))).unwrap();
        let results = out["results"].as_array().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0]["title"]
            .as_str()
            .unwrap()
            .contains("Machine Learning"));
        assert!(results[0]["relevance"].as_f64().unwrap() >= 0.10);
    }

    #[test]
    fn test_search_respects_max_results() {
        let out = search(&input_from(json!({
            "query": "machine learning sourdough pruning offside balance",
            "max_results": 2
        })))
        .unwrap();
        assert!(out["results"].as_array().unwrap().len() <= 2);
    }

    #[test]
    fn test_data_processor_sum() {
        let out = data_processor(&input_from(json!({
            "operation": "sum",
            "data": [1, 2, 3.5]
        })))
        .unwrap();
        assert_eq!(out["result"], json!(6.5));
        assert_eq!(out["count"], json!(3));
    }

    #[test]
    fn test_weather_parses_location_from_query() {
        let out = weather(&input_from(json!({
            "query": "current weather of London, UK and add the digits 5,8"
        })))
        .unwrap();
        assert_eq!(out["location"], json!("London, UK"));
        assert!(out["temperature_c"].as_i64().is_some());
    }

    #[test]
    fn test_weather_deterministic() {
        let input = input_from(json!({"location": "Paris"}));
        assert_eq!(weather(&input).unwrap(), weather(&input).unwrap());
    }

    #[test]
    fn test_default_catalog_bindings() {
        let catalog = BuiltinCatalog::default();
        for name in ["calculator", "search", "data_processor", "weather"] {
            assert!(catalog.get(name).is_some(), "missing builtin '{}'", name);
        }
        assert!(catalog.get("nope").is_none());
    }
}
