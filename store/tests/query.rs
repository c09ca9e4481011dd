//! Structured and smart queries against a populated soup

mod common;

use anyhow::Result;
use serde_json::json;
use soupstore::{ErrorKind, IndexSpec, OrderDirection, QuerySpec, SoupStore};

#[tokio::test]
async fn test_paging_ordered_by_age() -> Result<()> {
    let store = common::employees_store().await?;
    let spec = QuerySpec::all("employees", 2).order_by("age", OrderDirection::Ascending);

    assert_eq!(store.count(&spec).await?, 5);
    assert_eq!(common::field(&store.query(&spec, 0).await?, "lastName"), vec![&json!("Lucas"), &json!("Kwan")]);
    assert_eq!(common::field(&store.query(&spec, 1).await?, "lastName"), vec![&json!("Nakamura"), &json!("Thompson")]);
    assert_eq!(common::field(&store.query(&spec, 2).await?, "lastName"), vec![&json!("Haas")]);
    assert!(store.query(&spec, 3).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_exact_range_and_like() -> Result<()> {
    let store = common::employees_store().await?;

    let page = store.query(&QuerySpec::exact("employees", "employeeId", "00030", 10), 0).await?;
    assert_eq!(common::field(&page, "lastName"), vec![&json!("Haas")]);

    let range = QuerySpec::range("employees", "salary", Some(json!(100000)), Some(json!(200000.10)), 10).order_by("salary", OrderDirection::Descending);
    assert_eq!(common::field(&store.query(&range, 0).await?, "lastName"), vec![&json!("Thompson"), &json!("Nakamura"), &json!("Kwan")]);

    let open_ended = QuerySpec::range("employees", "age", Some(json!(45)), None, 10);
    assert_eq!(store.count(&open_ended).await?, 2);

    let like = QuerySpec::like("employees", "lastName", "%a%", 10).order_by("lastName", OrderDirection::Ascending);
    assert_eq!(common::field(&store.query(&like, 0).await?, "lastName"), vec![&json!("Haas"), &json!("Kwan"), &json!("Lucas"), &json!("Nakamura")]);
    Ok(())
}

#[tokio::test]
async fn test_query_on_unindexed_path() -> Result<()> {
    let store = common::employees_store().await?;
    let err = store.query(&QuerySpec::exact("employees", "firstName", "Test", 10), 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PathNotIndexed);

    let err = store.query(&QuerySpec::all("employees", 0), 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    Ok(())
}

#[tokio::test]
async fn test_query_spec_from_json() -> Result<()> {
    let store = common::employees_store().await?;
    let spec = QuerySpec::from_json(r#"{"soupName": "employees", "queryType": "range", "indexPath": "age", "beginKey": 30, "endKey": 40, "orderPath": "age", "order": "descending", "pageSize": 10}"#)?;
    assert_eq!(common::field(&store.query(&spec, 0).await?, "lastName"), vec![&json!("Nakamura"), &json!("Kwan")]);
    Ok(())
}

#[tokio::test]
async fn test_smart_sql() -> Result<()> {
    let store = common::employees_store().await?;

    let spec = QuerySpec::smart("SELECT {employees:lastName}, {employees:age} FROM {employees} WHERE {employees:age} > 40 ORDER BY {employees:lastName}", 10);
    assert_eq!(store.query(&spec, 0).await?, vec![json!(["Haas", 51]), json!(["Thompson", 45])]);
    assert_eq!(store.count(&spec).await?, 2);

    // payload columns come back as documents
    let spec = QuerySpec::smart("SELECT {employees:_soup} FROM {employees} WHERE {employees:employeeId} = '00040'", 10);
    let rows = store.query(&spec, 0).await?;
    assert_eq!(rows[0][0]["lastName"], json!("Lucas"));

    let spec = QuerySpec::smart("SELECT count(*) FROM {employees} WHERE {employees:firstName} = 'Test'", 10);
    assert_eq!(store.query(&spec, 0).await.unwrap_err().kind(), ErrorKind::PathNotIndexed);

    let spec = QuerySpec::smart("SELECT * FROM {nowhere}", 10);
    assert_eq!(store.query(&spec, 0).await.unwrap_err().kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_smart_sql_sees_altered_indexes() -> Result<()> {
    let store = common::employees_store().await?;
    let spec = QuerySpec::smart("SELECT {employees:lastName} FROM {employees} WHERE {employees:employeeId} = '00010'", 10);
    assert_eq!(store.query(&spec, 0).await?, vec![json!(["Thompson"])]);

    store.alter_soup("employees", None, vec![IndexSpec::string("lastName"), IndexSpec::string("employeeId")], true).await?;
    assert_eq!(store.query(&spec, 0).await?, vec![json!(["Thompson"])]);
    Ok(())
}

#[tokio::test]
async fn test_json1_index() -> Result<()> {
    let store = SoupStore::open_in_memory("test").await?;
    store.register_soup("people", vec![IndexSpec::string("name"), IndexSpec::json1("address.city")]).await?;
    store
        .upsert("people", vec![json!({"name": "a", "address": {"city": "Oslo"}}), json!({"name": "b", "address": {"city": "Lima"}}), json!({"name": "c"})])
        .await?;

    let page = store.query(&QuerySpec::exact("people", "address.city", "Lima", 10), 0).await?;
    assert_eq!(common::field(&page, "name"), vec![&json!("b")]);

    let sorted = QuerySpec::all("people", 10).order_by("address.city", OrderDirection::Descending);
    assert_eq!(common::field(&store.query(&sorted, 0).await?, "name"), vec![&json!("a"), &json!("b"), &json!("c")]);
    Ok(())
}

#[tokio::test]
async fn test_full_text_match() -> Result<()> {
    let store = SoupStore::open_in_memory("test").await?;
    if !store.supports_full_text() {
        return Ok(());
    }
    store.register_soup("notes", vec![IndexSpec::string("title"), IndexSpec::full_text("body"), IndexSpec::full_text("tags")]).await?;
    store
        .upsert(
            "notes",
            vec![
                json!({"title": "one", "body": "the quick brown fox", "tags": "animals"}),
                json!({"title": "two", "body": "lazy dogs sleep", "tags": "fox"}),
                json!({"title": "three", "body": "nothing here", "tags": "misc"}),
            ],
        )
        .await?;

    let anywhere = QuerySpec::matching("notes", None, "fox", 10);
    assert_eq!(common::field(&store.query(&anywhere, 0).await?, "title"), vec![&json!("one"), &json!("two")]);

    let in_body = QuerySpec::matching("notes", Some("body"), "fox", 10);
    assert_eq!(common::field(&store.query(&in_body, 0).await?, "title"), vec![&json!("one")]);

    // updates and removals keep the full-text index in step
    let mut two = store.retrieve("notes", &[2]).await?.remove(0);
    two["tags"] = json!("dogs");
    store.upsert("notes", vec![two]).await?;
    assert_eq!(store.count(&anywhere).await?, 1);

    assert_eq!(store.remove_by_query("notes", QuerySpec::matching("notes", Some("body"), "quick", 10)).await?, 1);
    assert_eq!(store.count(&anywhere).await?, 0);
    assert_eq!(store.count(&QuerySpec::all("notes", 10)).await?, 2);

    let err = store.query(&QuerySpec::matching("notes", Some("title"), "one", 10), 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    Ok(())
}

#[tokio::test]
async fn test_remove_by_query_ignores_page_size() -> Result<()> {
    let store = common::employees_store().await?;
    let removed = store.remove_by_query("employees", QuerySpec::range("employees", "age", Some(json!(30)), Some(json!(46)), 1)).await?;
    assert_eq!(removed, 3);
    let remaining = store.query(&QuerySpec::all("employees", 10).order_by("age", OrderDirection::Ascending), 0).await?;
    assert_eq!(common::field(&remaining, "lastName"), vec![&json!("Lucas"), &json!("Haas")]);

    let err = store.remove_by_query("employees", QuerySpec::all("other", 10)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSpec);
    Ok(())
}

#[tokio::test]
async fn test_remove_by_smart_query() -> Result<()> {
    let store = common::employees_store().await?;
    let spec = QuerySpec::smart("SELECT {employees:_soupEntryId} FROM {employees} WHERE {employees:salary} > 160000", 10);
    assert_eq!(store.remove_by_query("employees", spec).await?, 2);
    assert_eq!(store.count(&QuerySpec::all("employees", 10)).await?, 3);
    Ok(())
}

#[tokio::test]
async fn test_explain_query_plan_capture() -> Result<()> {
    let store = common::employees_store().await?;
    store.query(&QuerySpec::all("employees", 10), 0).await?;
    assert!(store.last_explain_query_plan().is_none());

    store.set_capture_explain_query_plan(true);
    store.query(&QuerySpec::exact("employees", "lastName", "Kwan", 10), 0).await?;
    let plan = store.last_explain_query_plan().expect("plan captured");
    assert!(!plan.rows.is_empty());
    assert!(plan.mentions("TABLE_1_1_idx"), "plan: {:?}", plan);
    Ok(())
}
