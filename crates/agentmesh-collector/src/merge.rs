use agentmesh_core::model::{FieldDef, FieldType};
use serde_json::Value;

const DEFAULT_HUMAN_KEY: &str = "name";

/// Merges one extraction pass into the collected data: scalar fields
/// overwrite; arrays of objects merge by a human-key match (matched items
/// are field-wise merged, unmatched items are appended); an explicit
/// `<field>_remove` key drops matching items.
pub fn merge_extracted(collected: &mut Value, extracted: &Value, fields: &[FieldDef]) {
    let Some(extracted_map) = extracted.as_object() else {
        return;
    };
    if !collected.is_object() {
        *collected = Value::Object(serde_json::Map::new());
    }
    let collected_map = collected.as_object_mut().expect("just ensured object");

    for (key, value) in extracted_map {
        if let Some(base_field) = key.strip_suffix("_remove") {
            remove_matching(collected_map, base_field, value);
            continue;
        }

        let field_def = fields.iter().find(|f| &f.name == key);
        let is_array_of_objects = matches!(field_def.map(|f| f.field_type), Some(FieldType::Array))
            && value.as_array().is_some_and(|arr| arr.iter().all(Value::is_object));

        if is_array_of_objects {
            merge_array_field(collected_map, key, value);
        } else {
            collected_map.insert(key.clone(), value.clone());
        }
    }
}

fn merge_array_field(collected_map: &mut serde_json::Map<String, Value>, key: &str, incoming: &Value) {
    let incoming_items = incoming.as_array().cloned().unwrap_or_default();
    let mut existing_items = collected_map
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for incoming_item in incoming_items {
        let incoming_key = human_key(&incoming_item);
        let matched = existing_items
            .iter_mut()
            .find(|existing| incoming_key.is_some() && human_key(existing) == incoming_key);

        match matched {
            Some(existing) => {
                if let (Some(existing_obj), Some(incoming_obj)) = (existing.as_object_mut(), incoming_item.as_object()) {
                    for (k, v) in incoming_obj {
                        existing_obj.insert(k.clone(), v.clone());
                    }
                }
            }
            None => existing_items.push(incoming_item),
        }
    }

    collected_map.insert(key.to_string(), Value::Array(existing_items));
}

fn remove_matching(collected_map: &mut serde_json::Map<String, Value>, base_field: &str, removal_spec: &Value) {
    let Some(existing) = collected_map.get_mut(base_field).and_then(Value::as_array_mut) else {
        return;
    };
    let removal_items = removal_spec.as_array().cloned().unwrap_or_default();
    for removal_item in removal_items {
        let removal_key = human_key(&removal_item);
        existing.retain(|item| removal_key.is_none() || human_key(item) != removal_key);
    }
}

fn human_key(value: &Value) -> Option<String> {
    value
        .get(DEFAULT_HUMAN_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
}
