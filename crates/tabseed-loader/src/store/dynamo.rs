//! DynamoDB table store
//!
//! Records travel as DynamoDB attribute maps. JSON numbers keep their literal
//! decimal text and are sent as `N` values. Key attributes follow the type the
//! table declares, read once per table from `DescribeTable`: tables created
//! here declare string keys, so numeric key values go out as `S` unless an
//! existing table declares the key as `N`.
//!
//! Throttling shows up two ways and both become [`StoreError::Throttled`]:
//! a throttling error code on the request, or a `BatchWriteItem` response
//! that hands back `UnprocessedItems`.

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::config::Region;
use aws_sdk_dynamodb::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, DeleteRequest, KeySchemaElement, KeyType,
    PutRequest, ScalarAttributeType, TableStatus as DynamoTableStatus, WriteRequest,
};
use aws_sdk_dynamodb::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tabseed_common::{Record, TableDescriptor};
use tracing::{debug, info};

use super::{ItemFault, PutReport, ScanPage, TableStatus, TableStore};
use crate::error::{StoreError, StoreResult};

/// Region used when neither a flag nor the AWS provider chain supplies one
pub const DEFAULT_REGION: &str = "us-east-1";

/// Error codes DynamoDB uses for capacity rejection
const THROTTLING_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
];

type Item = HashMap<String, AttributeValue>;

/// Declared scalar type of each key attribute of a table
type KeyTypes = HashMap<String, ScalarAttributeType>;

/// Connection settings for [`DynamoStore::connect`]
#[derive(Debug, Clone, Default)]
pub struct DynamoSettings {
    /// Explicit region; falls back to the provider chain, then [`DEFAULT_REGION`]
    pub region: Option<String>,
    /// Endpoint override, e.g. `http://localhost:8000` for DynamoDB Local
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DynamoStore {
    client: Client,
    key_types: Arc<Mutex<HashMap<String, KeyTypes>>>,
}

impl DynamoStore {
    /// Wrap an already configured client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            key_types: Arc::default(),
        }
    }

    /// Build a client from the standard AWS configuration chain
    pub async fn connect(settings: &DynamoSettings) -> Self {
        let region = RegionProviderChain::first_try(settings.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(Region::new(DEFAULT_REGION));

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(region)
            .load()
            .await;

        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(url) = &settings.endpoint_url {
            info!(endpoint = %url, "Using custom DynamoDB endpoint");
            builder = builder.endpoint_url(url);
        }

        debug!(region = ?shared.region(), "DynamoDB client configured");
        Self::new(Client::from_conf(builder.build()))
    }

    fn cached_key_types(&self, table: &str) -> Option<KeyTypes> {
        self.key_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .cloned()
    }

    fn remember_key_types(&self, table: &str, types: KeyTypes) {
        self.key_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string(), types);
    }

    /// Key attribute types of `table`, described on first use
    async fn key_types(&self, table: &str) -> StoreResult<KeyTypes> {
        if let Some(types) = self.cached_key_types(table) {
            return Ok(types);
        }
        self.describe_table(table).await?;
        Ok(self.cached_key_types(table).unwrap_or_default())
    }
}

// ============================================================================
// Error mapping
// ============================================================================

fn classify<E, R>(err: SdkError<E, R>, table: &str) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let code = err.code().unwrap_or("Unknown").to_string();
    let message = err
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());

    match code.as_str() {
        c if THROTTLING_CODES.contains(&c) => StoreError::throttled(0, message),
        "ResourceNotFoundException" => StoreError::TableNotFound(table.to_string()),
        "ResourceInUseException" => StoreError::TableExists(table.to_string()),
        _ => StoreError::service(code, message),
    }
}

fn build_error(err: BuildError) -> StoreError {
    StoreError::InvalidItem(err.to_string())
}

// ============================================================================
// Attribute conversion
// ============================================================================

/// Convert a JSON value to a DynamoDB attribute
pub fn to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(to_item(map)),
    }
}

/// Convert a record to a DynamoDB item
pub fn to_item(record: &Record) -> Item {
    record
        .iter()
        .map(|(name, value)| (name.clone(), to_attribute(value)))
        .collect()
}

fn key_types_from(definitions: &[AttributeDefinition]) -> KeyTypes {
    definitions
        .iter()
        .map(|d| (d.attribute_name().to_string(), d.attribute_type().clone()))
        .collect()
}

/// Convert a record to an item whose key attributes match the declared types.
///
/// Keys with no known type are treated as strings.
fn to_keyed_item(descriptor: &TableDescriptor, record: &Record, types: &KeyTypes) -> Item {
    let mut item = to_item(record);
    for key in descriptor.key_attributes() {
        let declared = types.get(key).unwrap_or(&ScalarAttributeType::S);
        let value = match (record.get(key), declared) {
            (Some(Value::Number(n)), ScalarAttributeType::S) => AttributeValue::S(n.to_string()),
            (Some(Value::String(s)), ScalarAttributeType::N) => AttributeValue::N(s.clone()),
            _ => continue,
        };
        item.insert(key.to_string(), value);
    }
    item
}

/// Convert a DynamoDB attribute back to JSON
pub fn from_attribute(value: &AttributeValue) -> StoreResult<Value> {
    Ok(match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => Value::Number(parse_number(n)?),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::L(items) => {
            Value::Array(items.iter().map(from_attribute).collect::<StoreResult<_>>()?)
        },
        AttributeValue::M(map) => Value::Object(from_item(map)?),
        AttributeValue::Ss(items) => Value::Array(items.iter().cloned().map(Value::String).collect()),
        AttributeValue::Ns(items) => Value::Array(
            items
                .iter()
                .map(|n| parse_number(n).map(Value::Number))
                .collect::<StoreResult<_>>()?,
        ),
        AttributeValue::B(_) | AttributeValue::Bs(_) => {
            return Err(StoreError::Unsupported("binary attribute".to_string()))
        },
        other => return Err(StoreError::Unsupported(format!("{other:?}"))),
    })
}

/// Convert a DynamoDB item back to a record
pub fn from_item(item: &Item) -> StoreResult<Record> {
    item.iter()
        .map(|(name, value)| Ok((name.clone(), from_attribute(value)?)))
        .collect()
}

fn parse_number(text: &str) -> StoreResult<serde_json::Number> {
    text.parse()
        .map_err(|_| StoreError::Unsupported(format!("number '{text}'")))
}

fn unprocessed_count(unprocessed: Option<&HashMap<String, Vec<WriteRequest>>>, table: &str) -> usize {
    unprocessed
        .and_then(|tables| tables.get(table))
        .map_or(0, Vec::len)
}

// ============================================================================
// TableStore
// ============================================================================

#[async_trait]
impl TableStore for DynamoStore {
    async fn ping(&self) -> StoreResult<()> {
        self.client
            .list_tables()
            .limit(1)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| classify(e, ""))
    }

    async fn describe_table(&self, table: &str) -> StoreResult<TableStatus> {
        let output = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        if let Some(definitions) = output
            .table
            .as_ref()
            .and_then(|t| t.attribute_definitions.as_deref())
        {
            self.remember_key_types(table, key_types_from(definitions));
        }

        let status = output.table.and_then(|t| t.table_status);
        Ok(match status {
            Some(DynamoTableStatus::Active) => TableStatus::Active,
            Some(DynamoTableStatus::Creating) => TableStatus::Creating,
            Some(DynamoTableStatus::Updating) => TableStatus::Updating,
            Some(DynamoTableStatus::Deleting) => TableStatus::Deleting,
            Some(other) => TableStatus::Other(other.as_str().to_string()),
            None => TableStatus::Other("UNKNOWN".to_string()),
        })
    }

    async fn create_table(&self, descriptor: &TableDescriptor) -> StoreResult<()> {
        let mut definitions = Vec::new();
        let mut schema = Vec::new();
        let key_types = [KeyType::Hash, KeyType::Range];

        for (name, key_type) in descriptor.key_attributes().zip(key_types) {
            definitions.push(
                AttributeDefinition::builder()
                    .attribute_name(name)
                    .attribute_type(ScalarAttributeType::S)
                    .build()
                    .map_err(build_error)?,
            );
            schema.push(
                KeySchemaElement::builder()
                    .attribute_name(name)
                    .key_type(key_type)
                    .build()
                    .map_err(build_error)?,
            );
        }

        self.client
            .create_table()
            .table_name(descriptor.table_name())
            .set_attribute_definitions(Some(definitions))
            .set_key_schema(Some(schema))
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(|e| classify(e, descriptor.table_name()))?;

        let types = descriptor
            .key_attributes()
            .map(|name| (name.to_string(), ScalarAttributeType::S))
            .collect();
        self.remember_key_types(descriptor.table_name(), types);
        Ok(())
    }

    async fn put_batch(
        &self,
        descriptor: &TableDescriptor,
        items: &[Record],
    ) -> StoreResult<PutReport> {
        let table = descriptor.table_name();
        let types = self.key_types(table).await?;
        let mut requests = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();

        for (index, record) in items.iter().enumerate() {
            match PutRequest::builder()
                .set_item(Some(to_keyed_item(descriptor, record, &types)))
                .build()
            {
                Ok(put) => requests.push(WriteRequest::builder().put_request(put).build()),
                Err(e) => rejected.push(ItemFault {
                    index,
                    reason: e.to_string(),
                }),
            }
        }

        if requests.is_empty() {
            return Ok(PutReport {
                written: 0,
                rejected,
            });
        }

        let sent = requests.len();
        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        let unprocessed = unprocessed_count(output.unprocessed_items.as_ref(), table);
        if unprocessed > 0 {
            return Err(StoreError::throttled(
                sent - unprocessed,
                format!("{unprocessed} of {sent} item(s) left unprocessed"),
            ));
        }

        Ok(PutReport {
            written: sent,
            rejected,
        })
    }

    async fn delete_batch(
        &self,
        descriptor: &TableDescriptor,
        keys: &[Record],
    ) -> StoreResult<usize> {
        let table = descriptor.table_name();
        let types = self.key_types(table).await?;
        let requests = keys
            .iter()
            .map(|key| {
                let delete = DeleteRequest::builder()
                    .set_key(Some(to_keyed_item(descriptor, key, &types)))
                    .build()
                    .map_err(build_error)?;
                Ok(WriteRequest::builder().delete_request(delete).build())
            })
            .collect::<StoreResult<Vec<_>>>()?;

        if requests.is_empty() {
            return Ok(0);
        }

        let sent = requests.len();
        let output = self
            .client
            .batch_write_item()
            .request_items(table, requests)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        let unprocessed = unprocessed_count(output.unprocessed_items.as_ref(), table);
        if unprocessed > 0 {
            return Err(StoreError::throttled(
                sent - unprocessed,
                format!("{unprocessed} of {sent} delete(s) left unprocessed"),
            ));
        }
        Ok(sent)
    }

    async fn scan_keys(
        &self,
        descriptor: &TableDescriptor,
        limit: Option<usize>,
        start: Option<Record>,
    ) -> StoreResult<ScanPage> {
        let table = descriptor.table_name();
        let start = match start {
            Some(key) => Some(to_keyed_item(descriptor, &key, &self.key_types(table).await?)),
            None => None,
        };

        // Placeholders keep reserved words usable as key names
        let mut request = self.client.scan().table_name(table);
        let mut projection = Vec::new();
        for (i, name) in descriptor.key_attributes().enumerate() {
            let placeholder = format!("#k{i}");
            request = request.expression_attribute_names(&placeholder, name);
            projection.push(placeholder);
        }

        let output = request
            .projection_expression(projection.join(", "))
            .set_limit(limit.map(|l| i32::try_from(l).unwrap_or(i32::MAX)))
            .set_exclusive_start_key(start)
            .send()
            .await
            .map_err(|e| classify(e, table))?;

        let keys = output
            .items
            .unwrap_or_default()
            .iter()
            .map(from_item)
            .collect::<StoreResult<Vec<_>>>()?;
        let next = output.last_evaluated_key.as_ref().map(from_item).transpose()?;

        Ok(ScanPage { keys, next })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_numbers_keep_literal_text() {
        let parsed: Value =
            serde_json::from_str(r#"{"precio": 12.50, "stock": 100000000000000000000001}"#).unwrap();
        let item = to_item(&record(parsed));
        assert_eq!(item["precio"], AttributeValue::N("12.50".to_string()));
        assert_eq!(item["stock"], AttributeValue::N("100000000000000000000001".to_string()));
    }

    #[test]
    fn test_nested_values() {
        let item = to_item(&record(json!({
            "tags": ["vegano", 3],
            "horario": {"abre": "09:00", "activo": true},
            "nota": null
        })));
        assert_eq!(
            item["tags"],
            AttributeValue::L(vec![
                AttributeValue::S("vegano".into()),
                AttributeValue::N("3".into())
            ])
        );
        assert!(matches!(&item["horario"], AttributeValue::M(m) if m.len() == 2));
        assert_eq!(item["nota"], AttributeValue::Null(true));
    }

    fn definition(name: &str, kind: ScalarAttributeType) -> AttributeDefinition {
        AttributeDefinition::builder()
            .attribute_name(name)
            .attribute_type(kind)
            .build()
            .unwrap()
    }

    #[test]
    fn test_numeric_keys_are_sent_as_strings_by_default() {
        let d = TableDescriptor::new("pedidos", "local_id", Some("pedido_id")).unwrap();
        let row = record(json!({"local_id": "L1", "pedido_id": 42, "total": 9}));

        let item = to_keyed_item(&d, &row, &KeyTypes::new());
        assert_eq!(item["pedido_id"], AttributeValue::S("42".into()));
        assert_eq!(item["total"], AttributeValue::N("9".into()));
    }

    #[test]
    fn test_keys_follow_declared_number_type() {
        let d = TableDescriptor::new("pedidos", "local_id", Some("pedido_id")).unwrap();
        let types = key_types_from(&[
            definition("local_id", ScalarAttributeType::S),
            definition("pedido_id", ScalarAttributeType::N),
        ]);

        let item = to_keyed_item(&d, &record(json!({"local_id": 7, "pedido_id": 42})), &types);
        assert_eq!(item["local_id"], AttributeValue::S("7".into()));
        assert_eq!(item["pedido_id"], AttributeValue::N("42".into()));

        // Numeric text in a string still has to go out as a number
        let item = to_keyed_item(&d, &record(json!({"local_id": "L1", "pedido_id": "43"})), &types);
        assert_eq!(item["pedido_id"], AttributeValue::N("43".into()));
    }

    #[test]
    fn test_round_trip_key_projection() {
        let mut key = Item::new();
        key.insert("local_id".into(), AttributeValue::S("L1".into()));
        key.insert("orden".into(), AttributeValue::N("7".into()));
        let back = from_item(&key).unwrap();
        assert_eq!(back["local_id"], "L1");
        assert_eq!(back["orden"].to_string(), "7");
    }

    #[test]
    fn test_binary_is_unsupported() {
        let blob = AttributeValue::B(aws_sdk_dynamodb::primitives::Blob::new(vec![1, 2]));
        assert!(matches!(from_attribute(&blob), Err(StoreError::Unsupported(_))));
    }

    #[test]
    fn test_unprocessed_count() {
        let mut map = HashMap::new();
        map.insert(
            "locales".to_string(),
            vec![WriteRequest::builder().build(), WriteRequest::builder().build()],
        );
        assert_eq!(unprocessed_count(Some(&map), "locales"), 2);
        assert_eq!(unprocessed_count(Some(&map), "pedidos"), 0);
        assert_eq!(unprocessed_count(None, "locales"), 0);
    }
}
