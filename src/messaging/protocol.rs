use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息的 JSON 內容類型
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// AMQP 持久化投遞模式
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// 消息屬性，對應 AMQP basic properties 中本層使用的部分
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// 2 表示持久化
    pub delivery_mode: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Unix 時間戳（秒）
    pub timestamp: Option<u64>,
}

impl MessageProperties {
    /// 持久化的 JSON 消息屬性
    pub fn persistent_json() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            delivery_mode: Some(DELIVERY_MODE_PERSISTENT),
            timestamp: Some(Utc::now().timestamp().max(0) as u64),
            ..Self::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }
}

/// 從代理收到的原始消息
#[derive(Clone, Debug)]
pub struct Delivery {
    /// 確認/否定確認用的投遞標籤，只在所屬通道內有效
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

impl Delivery {
    /// 將消息體解碼為 JSON，空消息體視為 `null`
    pub fn json_body(&self) -> Result<Value, serde_json::Error> {
        if self.data.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.data)
    }

    pub fn metadata(&self, queue: &str, consumer_tag: &str) -> DeliveryMetadata {
        DeliveryMetadata {
            delivery_tag: self.delivery_tag,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            correlation_id: self.properties.correlation_id.clone(),
            reply_to: self.properties.reply_to.clone(),
            message_id: self.properties.message_id.clone(),
            content_type: self.properties.content_type.clone(),
            persistent: self.properties.is_persistent(),
        }
    }
}

/// 傳給處理器的投遞元數據
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryMetadata {
    pub delivery_tag: u64,
    pub queue: String,
    pub consumer_tag: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub persistent: bool,
}

/// 領域事件封裝
///
/// 序列化為扁平的 `{"event", "service", "timestamp", ...欄位}` 結構。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event: String,
    pub service: String,
    #[serde(with = "rfc3339")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DomainEvent {
    /// 創建新事件，時間戳為當前時間
    pub fn new(event: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            service: service.into(),
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    /// 添加業務欄位
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// 以 JSON 物件合併多個欄位，非物件值會被忽略
    pub fn with_fields(mut self, fields: Value) -> Self {
        if let Value::Object(map) = fields {
            self.fields.extend(map);
        }
        self
    }

    /// 事件名稱即路由鍵
    pub fn routing_key(&self) -> &str {
        &self.event
    }
}

mod rfc3339 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_domain_event_serializes_flat() {
        let event = DomainEvent::new("order.created", "orders")
            .with_field("order_id", 42)
            .with_fields(json!({"total": 19.5, "items": ["a", "b"]}));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "order.created");
        assert_eq!(value["service"], "orders");
        assert_eq!(value["order_id"], 42);
        assert_eq!(value["items"], json!(["a", "b"]));
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));

        let back: DomainEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back.fields["total"], json!(19.5));
        assert_eq!(back.routing_key(), "order.created");
    }

    #[test]
    fn test_empty_body_decodes_to_null() {
        let delivery = Delivery {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "q".into(),
            redelivered: false,
            properties: MessageProperties::default(),
            data: Vec::new(),
        };
        assert_eq!(delivery.json_body().unwrap(), Value::Null);
    }

    #[test]
    fn test_persistent_json_properties() {
        let properties = MessageProperties::persistent_json().with_correlation_id("c-1");
        assert!(properties.is_persistent());
        assert_eq!(properties.content_type.as_deref(), Some(CONTENT_TYPE_JSON));
        assert_eq!(properties.correlation_id.as_deref(), Some("c-1"));
    }
}
