//! Classification of decoded records into delivery batches.
//!
//! Everything in here is pure: no I/O, and every record shape maps to exactly one decision.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use poster_common::record::DecodedRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::config::ConfigError;

/// The operation a batch performs on the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Create or update, sent as a POST.
    Upsert,
    /// Sent as a DELETE.
    Delete,
}

impl Operation {
    pub fn method(&self) -> http::Method {
        match self {
            Operation::Upsert => http::Method::POST,
            Operation::Delete => http::Method::DELETE,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::Upsert => write!(f, "upsert"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// One row of the route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Dotted path of the field to inspect, e.g. `fixedFields.61.value`.
    pub match_field: String,
    /// Accepted values for `match_field`, compared as strings.
    #[serde(default)]
    pub match_values: BTreeSet<String>,
    pub endpoint: String,
    pub operation: Operation,
}

impl Route {
    fn matches(&self, record: &DecodedRecord) -> bool {
        record
            .field(&self.match_field)
            .and_then(match_key)
            .is_some_and(|key| self.match_values.contains(&key))
    }
}

/// Render a scalar field value the way it is written in the route table. Containers and null
/// never match.
fn match_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.to_owned()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// What to do with a single decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Forward(String),
    Delete(String),
    Suppress,
}

/// An ordered group of records sharing an operation and an endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryBatch {
    pub operation: Operation,
    pub endpoint: String,
    pub records: Vec<DecodedRecord>,
}

/// The result of routing a whole batch.
#[derive(Debug, Default, PartialEq)]
pub struct Partition {
    /// Non-empty batches, in order of the first record that landed in each.
    pub batches: Vec<DeliveryBatch>,
    pub suppressed: Vec<DecodedRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Resolve every endpoint against `base`, so relative endpoints like `bibs` become full URLs.
    pub fn resolve(self, base: &Url) -> Result<RouteTable, ConfigError> {
        let routes = self
            .routes
            .into_iter()
            .map(|route| {
                let endpoint = base
                    .join(&route.endpoint)
                    .map_err(|error| ConfigError::InvalidEndpoint {
                        endpoint: route.endpoint.clone(),
                        error,
                    })?;

                Ok(Route {
                    endpoint: endpoint.to_string(),
                    ..route
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(RouteTable { routes })
    }

    /// Where deleted records go: the first delete route, or the first upsert route's endpoint
    /// when no delete route is configured.
    fn delete_endpoint(&self) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.operation == Operation::Delete)
            .or_else(|| self.routes.first())
            .map(|route| route.endpoint.as_str())
    }

    /// Decide what to do with a record.
    ///
    /// Deleted records are always deleted, whatever their type. Anything else is forwarded to the
    /// first upsert route whose field matches one of its accepted values, or suppressed.
    pub fn classify(&self, record: &DecodedRecord) -> RouteDecision {
        if record.is_deleted() {
            return match self.delete_endpoint() {
                Some(endpoint) => RouteDecision::Delete(endpoint.to_owned()),
                None => RouteDecision::Suppress,
            };
        }

        self.routes
            .iter()
            .filter(|route| route.operation == Operation::Upsert)
            .find(|route| route.matches(record))
            .map_or(RouteDecision::Suppress, |route| {
                RouteDecision::Forward(route.endpoint.clone())
            })
    }

    /// Classify every record and group them by `(operation, endpoint)`.
    pub fn partition(&self, records: Vec<DecodedRecord>) -> Partition {
        records
            .into_iter()
            .fold(Partition::default(), |mut partition, record| {
                let (operation, endpoint) = match self.classify(&record) {
                    RouteDecision::Forward(endpoint) => (Operation::Upsert, endpoint),
                    RouteDecision::Delete(endpoint) => (Operation::Delete, endpoint),
                    RouteDecision::Suppress => {
                        partition.suppressed.push(record);
                        return partition;
                    }
                };

                match partition
                    .batches
                    .iter_mut()
                    .find(|b| b.operation == operation && b.endpoint == endpoint)
                {
                    Some(batch) => batch.records.push(record),
                    None => partition.batches.push(DeliveryBatch {
                        operation,
                        endpoint,
                        records: vec![record],
                    }),
                }

                partition
            })
    }
}

/// Parse a JSON array of routes, as found in the `ROUTES` variable.
impl FromStr for RouteTable {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let routes: Vec<Route> = serde_json::from_str(s)?;
        Ok(RouteTable::new(routes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ITEMS: &str = "https://platform.example.org/api/v0.1/items";
    const BIBS: &str = "https://platform.example.org/api/v0.1/bibs";

    fn record(value: Value) -> DecodedRecord {
        match value {
            Value::Object(fields) => DecodedRecord::new(fields),
            _ => panic!("test records must be objects"),
        }
    }

    fn item(id: &str, item_type: Value, deleted: bool) -> DecodedRecord {
        record(json!({
            "id": id,
            "deleted": deleted,
            "fixedFields": {"61": {"label": "Item Type", "value": item_type}}
        }))
    }

    fn items_table() -> RouteTable {
        RouteTable::new(vec![Route {
            match_field: "fixedFields.61.value".to_owned(),
            match_values: BTreeSet::from(["6".to_owned()]),
            endpoint: ITEMS.to_owned(),
            operation: Operation::Upsert,
        }])
    }

    #[test]
    fn test_deleted_records_are_deleted_regardless_of_type() {
        let table = items_table();

        for item_type in [json!("6"), json!("99"), json!(null), json!({"nested": 1})] {
            assert_eq!(
                table.classify(&item("i1", item_type, true)),
                RouteDecision::Delete(ITEMS.to_owned())
            );
        }
    }

    #[test]
    fn test_deleted_records_prefer_the_delete_route() {
        let mut routes = items_table().routes().to_vec();
        routes.push(Route {
            match_field: "id".to_owned(),
            match_values: BTreeSet::new(),
            endpoint: BIBS.to_owned(),
            operation: Operation::Delete,
        });
        let table = RouteTable::new(routes);

        assert_eq!(
            table.classify(&item("i1", json!("6"), true)),
            RouteDecision::Delete(BIBS.to_owned())
        );
        assert_eq!(
            table.classify(&item("i2", json!("6"), false)),
            RouteDecision::Forward(ITEMS.to_owned())
        );
    }

    #[test]
    fn test_non_matching_records_are_suppressed() {
        let table = items_table();

        for item_type in [json!("7"), json!(""), json!(null), json!(["6"]), json!({"v": "6"})] {
            assert_eq!(
                table.classify(&item("i1", item_type, false)),
                RouteDecision::Suppress
            );
        }
    }

    #[test]
    fn test_numeric_values_match_their_decimal_form() {
        assert_eq!(
            items_table().classify(&item("i1", json!(6), false)),
            RouteDecision::Forward(ITEMS.to_owned())
        );
    }

    #[test]
    fn test_missing_fields_are_suppressed_not_a_crash() {
        let table = items_table();

        assert_eq!(table.classify(&record(json!({}))), RouteDecision::Suppress);
        assert_eq!(
            table.classify(&record(json!({"fixedFields": "not an object"}))),
            RouteDecision::Suppress
        );
        assert_eq!(
            table.classify(&record(json!({"deleted": "yes", "fixedFields": {}}))),
            RouteDecision::Suppress
        );
    }

    #[test]
    fn test_first_matching_route_wins() {
        let table = RouteTable::new(vec![
            Route {
                match_field: "materialType.value".to_owned(),
                match_values: BTreeSet::from(["Book".to_owned()]),
                endpoint: BIBS.to_owned(),
                operation: Operation::Upsert,
            },
            Route {
                match_field: "materialType.value".to_owned(),
                match_values: BTreeSet::from(["Book".to_owned(), "Score".to_owned()]),
                endpoint: ITEMS.to_owned(),
                operation: Operation::Upsert,
            },
        ]);

        assert_eq!(
            table.classify(&record(json!({"materialType": {"value": "Book"}}))),
            RouteDecision::Forward(BIBS.to_owned())
        );
        assert_eq!(
            table.classify(&record(json!({"materialType": {"value": "Score"}}))),
            RouteDecision::Forward(ITEMS.to_owned())
        );
    }

    #[test]
    fn test_empty_table_suppresses_everything() {
        let table = RouteTable::default();

        assert_eq!(
            table.classify(&item("i1", json!("6"), true)),
            RouteDecision::Suppress
        );
    }

    #[test]
    fn test_partition_groups_by_operation_and_endpoint() {
        let table = items_table();
        let records = vec![
            item("deleted", json!("99"), true),
            item("matching", json!("6"), false),
            item("other", json!("7"), false),
        ];

        let partition = table.partition(records);

        assert_eq!(partition.batches.len(), 2);
        assert_eq!(partition.batches[0].operation, Operation::Delete);
        assert_eq!(partition.batches[0].records.len(), 1);
        assert_eq!(partition.batches[0].records[0].id().as_deref(), Some("deleted"));
        assert_eq!(partition.batches[1].operation, Operation::Upsert);
        assert_eq!(partition.batches[1].endpoint, ITEMS);
        assert_eq!(partition.batches[1].records.len(), 1);
        assert_eq!(partition.batches[1].records[0].id().as_deref(), Some("matching"));
        assert_eq!(partition.suppressed.len(), 1);
        assert_eq!(partition.suppressed[0].id().as_deref(), Some("other"));
    }

    #[test]
    fn test_partition_keeps_record_order_within_a_batch() {
        let table = items_table();
        let records = vec![
            item("a", json!("6"), false),
            item("b", json!("7"), false),
            item("c", json!("6"), false),
        ];

        let partition = table.partition(records);
        let ids: Vec<_> = partition.batches[0]
            .records
            .iter()
            .filter_map(DecodedRecord::id)
            .collect();

        assert_eq!(partition.batches.len(), 1);
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_parse_route_table() {
        let table: RouteTable = r#"[{"match_field": "fixedFields.61.value", "match_values": ["6", "23"], "endpoint": "items", "operation": "upsert"}]"#
            .parse()
            .expect("failed to parse routes");

        assert_eq!(table.routes().len(), 1);
        assert_eq!(table.routes()[0].match_values.len(), 2);
        assert!("[{\"operation\": \"merge\"}]".parse::<RouteTable>().is_err());
    }

    #[test]
    fn test_operation_methods() {
        assert_eq!(Operation::Upsert.method(), http::Method::POST);
        assert_eq!(Operation::Delete.method(), http::Method::DELETE);
    }
}
