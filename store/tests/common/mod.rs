#![allow(unused)]

use std::str::FromStr;

use serde_json::{json, Value};
use soupstore::{IndexSpec, SoupStore};
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    // if LOG_LEVEL env var is set, use it
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::fmt().with_max_level(Level::from_str(&level).unwrap()).with_test_writer().init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
    }
}

pub fn employee_specs() -> Vec<IndexSpec> { vec![IndexSpec::string("employeeId"), IndexSpec::string("lastName"), IndexSpec::integer("age"), IndexSpec::floating("salary")] }

pub fn employee(id: &str, last_name: &str, age: i64, salary: f64) -> Value {
    json!({ "employeeId": id, "firstName": "Test", "lastName": last_name, "age": age, "salary": salary })
}

/// An in-memory store with an `employees` soup holding five people
pub async fn employees_store() -> anyhow::Result<SoupStore> {
    let store = SoupStore::open_in_memory("test").await?;
    store.register_soup("employees", employee_specs()).await?;
    store
        .upsert(
            "employees",
            vec![
                employee("00010", "Thompson", 45, 200000.10),
                employee("00020", "Kwan", 32, 120000.10),
                employee("00030", "Haas", 51, 300000.50),
                employee("00040", "Lucas", 28, 90000.00),
                employee("00050", "Nakamura", 39, 150000.25),
            ],
        )
        .await?;
    Ok(store)
}

pub fn field<'a>(entries: &'a [Value], key: &str) -> Vec<&'a Value> { entries.iter().map(|e| &e[key]).collect() }
