use chrono::Utc;
use std::collections::HashMap;
use uuid::Uuid;
use xsync_db::{fetch_active_sync_configs, fetch_sync_config, insert_sync_config, insert_user, testkit_db_pool};
use xsync_schemas::{SyncConfig, SyncDirection, User};

fn new_user() -> User {
    User {
        id: Uuid::new_v4(),
        email: format!("{}@example.test", Uuid::new_v4()),
        plan: Some("starter".into()),
        subscription_status: None,
        trial_started_at: None,
        trial_ends_at: None,
    }
}

fn new_sync_config(user_id: Uuid) -> SyncConfig {
    let mut field_mappings = HashMap::new();
    field_mappings.insert("Name".to_string(), 0);
    field_mappings.insert("Tier".to_string(), 1);

    SyncConfig {
        id: Uuid::new_v4(),
        user_id,
        name: "accounts sync".into(),
        sor_base_id: "base1".into(),
        sor_table_id: "table1".into(),
        sor_view_id: None,
        grid_workbook_id: "wb1".into(),
        grid_sheet_id: "sheet1".into(),
        field_mappings,
        direction: SyncDirection::SorToGrid,
        conflict_strategy: None,
        is_active: true,
        last_sync_at: None,
        last_sync_status: None,
        last_error_at: None,
        last_error_message: None,
    }
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointed at a live Postgres instance"]
async fn sync_config_round_trips_through_postgres() {
    let pool = testkit_db_pool().await.expect("db pool");
    let user = new_user();
    insert_user(&pool, &user).await.expect("insert user");

    let cfg = new_sync_config(user.id);
    insert_sync_config(&pool, &cfg).await.expect("insert sync config");

    let fetched = fetch_sync_config(&pool, cfg.id).await.expect("fetch sync config");
    assert_eq!(fetched.name, cfg.name);
    assert_eq!(fetched.field_mappings, cfg.field_mappings);
    assert_eq!(fetched.direction, cfg.direction);

    let active = fetch_active_sync_configs(&pool).await.expect("fetch active");
    assert!(active.iter().any(|c| c.id == cfg.id));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointed at a live Postgres instance"]
async fn inserting_bidirectional_config_without_conflict_strategy_is_rejected() {
    let pool = testkit_db_pool().await.expect("db pool");
    let user = new_user();
    insert_user(&pool, &user).await.expect("insert user");

    let mut cfg = new_sync_config(user.id);
    cfg.direction = SyncDirection::Bidirectional;
    cfg.conflict_strategy = None;

    let err = insert_sync_config(&pool, &cfg).await.unwrap_err();
    assert!(err.to_string().contains("conflict_strategy"));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL pointed at a live Postgres instance"]
async fn run_log_completed_at_before_started_at_is_rejected_by_schema() {
    use xsync_db::insert_run_log;
    use xsync_schemas::{RunLog, TriggeredBy};

    let pool = testkit_db_pool().await.expect("db pool");
    let user = new_user();
    insert_user(&pool, &user).await.expect("insert user");
    let cfg = new_sync_config(user.id);
    insert_sync_config(&pool, &cfg).await.expect("insert sync config");

    let mut log = RunLog::start(cfg.id, TriggeredBy::Manual, SyncDirection::SorToGrid);
    log.completed_at = Some(log.started_at - chrono::Duration::seconds(1));

    let err = insert_run_log(&pool, &log).await.unwrap_err();
    assert!(err.to_string().contains("run_logs_completed_not_before_started")
        || err.to_string().to_lowercase().contains("check constraint"));
    let _ = Utc::now();
}
