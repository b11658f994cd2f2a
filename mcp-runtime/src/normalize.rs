//! Flattens remote entities into plain JSON output records.
//!
//! Every function here is total and side-effect free. Scalars the server
//! omitted come out as `null`; nested collections (comments, attachments,
//! task fields) are only included when the source provided a non-empty
//! list, so callers must not assume those keys exist. Entity contracts that
//! always carry a list (form fields, organization members, announcement
//! comments, list children) get an empty array instead.

use serde_json::{Map, Value, json};

use crate::model::{
    Announcement, AnnouncementComment, CatalogItem, Comment, File, Form, FormField, Organization,
    Person, Role, Task, TaskList,
};

/// Timestamps are rendered through the chrono `Display` form, which is
/// stable across releases; absent timestamps become `null`.
fn date_string<T: std::fmt::Display>(value: Option<&T>) -> Value {
    match value {
        Some(v) => Value::String(v.to_string()),
        None => Value::Null,
    }
}

pub fn person(person: Option<&Person>) -> Value {
    let Some(person) = person else {
        return Value::Null;
    };
    let name = format!(
        "{} {}",
        person.first_name.as_deref().unwrap_or(""),
        person.last_name.as_deref().unwrap_or("")
    );
    json!({
        "id": person.id,
        "name": name.trim(),
        "email": person.email,
    })
}

pub fn task_header(task: &Task) -> Value {
    json!({
        "id": task.id,
        "text": task.text,
        "author": person(task.author.as_ref()),
        "responsible": person(task.responsible.as_ref()),
        "create_date": date_string(task.create_date.as_ref()),
        "due_date": date_string(task.due_date.as_ref()),
    })
}

pub fn task(task: &Task) -> Value {
    let mut result = match task_header(task) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    result.insert("subject".to_string(), json!(task.subject));
    let status = if task.close_date.is_some() {
        "closed"
    } else {
        "open"
    };
    result.insert("status".to_string(), json!(status));
    result.insert(
        "close_date".to_string(),
        date_string(task.close_date.as_ref()),
    );
    result.insert("form_id".to_string(), json!(task.form_id));
    result.insert(
        "scheduled_date".to_string(),
        date_string(task.scheduled_date.as_ref()),
    );

    if let Some(comments) = &task.comments {
        if !comments.is_empty() {
            result.insert(
                "comments".to_string(),
                Value::Array(comments.iter().map(comment).collect()),
            );
        }
    }
    if let Some(fields) = &task.fields {
        if !fields.is_empty() {
            result.insert(
                "fields".to_string(),
                Value::Array(fields.iter().map(field).collect()),
            );
        }
    }
    if let Some(attachments) = &task.attachments {
        if !attachments.is_empty() {
            result.insert(
                "attachments".to_string(),
                Value::Array(attachments.iter().map(file).collect()),
            );
        }
    }

    Value::Object(result)
}

pub fn file(file: &File) -> Value {
    json!({
        "id": file.id,
        "name": file.name,
        "size": file.size,
        "md5": file.md5,
        "url": file.url,
        "version": file.version,
        "root_id": file.root_id,
    })
}

pub fn comment(comment: &Comment) -> Value {
    let mut result = json!({
        "id": comment.id,
        "text": comment.text,
        "author": person(comment.author.as_ref()),
        "create_date": date_string(comment.create_date.as_ref()),
        "action": comment.action,
    });
    if let Some(attachments) = &comment.attachments {
        if !attachments.is_empty() {
            result["attachments"] = Value::Array(attachments.iter().map(file).collect());
        }
    }
    result
}

pub fn field(field: &FormField) -> Value {
    // Values the output format cannot carry verbatim (nested tables,
    // catalog references) are stringified rather than rejected.
    let value = match &field.value {
        None => Value::Null,
        Some(v @ (Value::Object(_) | Value::Array(_))) => Value::String(v.to_string()),
        Some(v) => v.clone(),
    };
    json!({
        "id": field.id,
        "name": field.name,
        "type": field.field_type,
        "value": value,
    })
}

pub fn form(form: &Form) -> Value {
    let fields: Vec<Value> = form
        .fields
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(form_field_info)
        .collect();
    json!({
        "id": form.id,
        "name": form.name,
        "steps": form.steps,
        "fields": fields,
    })
}

/// Field template definition, as opposed to a filled-in task field.
pub fn form_field_info(field: &FormField) -> Value {
    json!({
        "id": field.id,
        "name": field.name,
        "type": field.field_type,
        "required_step": field.info.as_ref().and_then(|info| info.required_step),
    })
}

pub fn organization(org: &Organization) -> Value {
    let persons: Vec<Value> = org
        .persons
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|p| person(Some(p)))
        .collect();
    let roles: Vec<Value> = org
        .roles
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(role)
        .collect();
    json!({
        "id": org.organization_id,
        "name": org.name,
        "persons": persons,
        "roles": roles,
    })
}

pub fn role(role: &Role) -> Value {
    json!({
        "id": role.id,
        "name": role.name,
        "member_ids": role.member_ids,
    })
}

pub fn announcement(announcement: &Announcement) -> Value {
    let comments: Vec<Value> = announcement
        .comments
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(announcement_comment)
        .collect();
    json!({
        "id": announcement.id,
        "text": announcement.text,
        "author": person(announcement.author.as_ref()),
        "create_date": date_string(announcement.create_date.as_ref()),
        "comments": comments,
    })
}

pub fn announcement_comment(comment: &AnnouncementComment) -> Value {
    json!({
        "id": comment.id,
        "text": comment.text,
        "author": person(comment.author.as_ref()),
        "create_date": date_string(comment.create_date.as_ref()),
    })
}

pub fn task_list(list: &TaskList) -> Value {
    let children: Vec<Value> = list
        .children
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(task_list)
        .collect();
    json!({
        "id": list.id,
        "name": list.name,
        "children": children,
    })
}

pub fn catalog_item(item: &CatalogItem) -> Value {
    json!({
        "item_id": item.item_id,
        "values": item.values,
    })
}
