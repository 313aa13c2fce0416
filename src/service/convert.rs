//! Conversions between the in-memory metric model and its wire form.

use chrono::{DateTime, Utc};
use plugin_proto::pluginrpc;

use crate::metric::{Metric, Value};
use crate::namespace::{Namespace, NamespaceElement};
use crate::plugin::CollectorDefinition;

pub(crate) fn metric_to_proto(
    metric: &Metric,
    schema: Option<&CollectorDefinition>,
) -> pluginrpc::Metric {
    pluginrpc::Metric {
        namespace: metric
            .namespace()
            .elements()
            .iter()
            .map(|element| element_to_proto(element, schema))
            .collect(),
        value: Some(value_to_proto(metric.value())),
        tags: metric.tags().clone(),
        timestamp: Some(time_to_proto(metric.timestamp())),
        description: metric.description().to_string(),
        unit: metric.unit().to_string(),
    }
}

/// Rebuilds a metric from its wire form. A `name=value` namespace segment
/// becomes a dynamic binding; everything else is a static level.
pub(crate) fn metric_from_proto(metric: pluginrpc::Metric) -> Metric {
    let elements = metric
        .namespace
        .into_iter()
        .map(|element| {
            if element.name.is_empty() {
                NamespaceElement::StaticSpecific {
                    name: element.value,
                    accepts_group: false,
                }
            } else {
                NamespaceElement::DynamicSpecific {
                    group: element.name,
                    value: element.value,
                    accepts_bare: false,
                }
            }
        })
        .collect();

    Metric {
        namespace: Namespace::new(elements),
        value: metric
            .value
            .and_then(|value| value.data_variant)
            .map(value_from_proto)
            .unwrap_or(Value::Int(0)),
        tags: metric.tags,
        unit: metric.unit,
        timestamp: metric
            .timestamp
            .map(time_from_proto)
            .unwrap_or_else(Utc::now),
        description: metric.description,
    }
}

fn element_to_proto(
    element: &NamespaceElement,
    schema: Option<&CollectorDefinition>,
) -> pluginrpc::NamespaceElement {
    let description = if element.is_dynamic() {
        schema
            .and_then(|schema| schema.group_description(element.name()))
            .unwrap_or_default()
            .to_string()
    } else {
        String::new()
    };

    pluginrpc::NamespaceElement {
        name: element.name().to_string(),
        value: element.value().to_string(),
        description,
    }
}

fn value_to_proto(value: &Value) -> pluginrpc::MetricValue {
    use pluginrpc::metric_value::DataVariant;

    let variant = match value {
        Value::Int(v) => DataVariant::VInt64(*v),
        Value::UInt(v) => DataVariant::VUint64(*v),
        Value::Float(v) => DataVariant::VDouble(*v),
        Value::Bool(v) => DataVariant::VBool(*v),
        Value::Str(v) => DataVariant::VString(v.clone()),
        Value::Bytes(v) => DataVariant::VBytes(v.clone()),
    };

    pluginrpc::MetricValue {
        data_variant: Some(variant),
    }
}

fn value_from_proto(variant: pluginrpc::metric_value::DataVariant) -> Value {
    use pluginrpc::metric_value::DataVariant;

    match variant {
        DataVariant::VInt64(v) => Value::Int(v),
        DataVariant::VUint64(v) => Value::UInt(v),
        DataVariant::VDouble(v) => Value::Float(v),
        DataVariant::VBool(v) => Value::Bool(v),
        DataVariant::VString(v) => Value::Str(v),
        DataVariant::VBytes(v) => Value::Bytes(v),
    }
}

fn time_to_proto(timestamp: DateTime<Utc>) -> pluginrpc::Time {
    pluginrpc::Time {
        sec: timestamp.timestamp(),
        nsec: i64::from(timestamp.timestamp_subsec_nanos()),
    }
}

fn time_from_proto(time: pluginrpc::Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.sec, time.nsec.try_into().unwrap_or(0)).unwrap_or_default()
}
