use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use stormcloud_common::{
    NewRule, ResponseVariant, Rule, RuleDraft, Substitution, SubstitutionDraft, VariantDraft,
    Vendor, VendorDraft,
};
use stormcloud_core::{RuleStore, StoreError};
use tracing::{debug, info};

const RULE_COLUMNS: &str =
    "id, vendor_id, hostname, path, verb, action, delay_ms, live_url, created_at";

/// Optional filters for the admin rule listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuleFilter {
    pub vendor_id: Option<i64>,
    pub verb: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        // Cascades and SET NULL only work with foreign keys switched on
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("✓ Database initialized and migrated at {}", database_url);
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // Vendors

    pub async fn list_vendors(&self) -> Result<Vec<Vendor>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, base_url, override_instructions FROM vendors ORDER BY name, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(vendor_from_row).collect()
    }

    pub async fn get_vendor(&self, id: i64) -> Result<Vendor, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, base_url, override_instructions FROM vendors WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => vendor_from_row(&row),
            None => Err(StoreError::NotFound { kind: "vendor", id }),
        }
    }

    pub async fn create_vendor(&self, draft: VendorDraft) -> Result<Vendor, StoreError> {
        let result = sqlx::query(
            "INSERT INTO vendors (name, base_url, override_instructions) VALUES (?, ?, ?)",
        )
        .bind(&draft.name)
        .bind(&draft.base_url)
        .bind(&draft.override_instructions)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(table = "vendors", vendor = %draft.name, "Vendor created");
        self.get_vendor(result.last_insert_rowid()).await
    }

    pub async fn update_vendor(&self, id: i64, draft: VendorDraft) -> Result<Vendor, StoreError> {
        let result = sqlx::query(
            "UPDATE vendors SET name = ?, base_url = ?, override_instructions = ? WHERE id = ?",
        )
        .bind(&draft.name)
        .bind(&draft.base_url)
        .bind(&draft.override_instructions)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "vendor", id });
        }
        self.get_vendor(id).await
    }

    /// Delete a vendor. Its rules stay behind without a vendor.
    ///
    /// Refused with [`StoreError::Conflict`] when one of those rules would
    /// collide with an existing vendor-less rule for the same path and verb.
    pub async fn delete_vendor(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let clash = sqlx::query(
            r#"
            SELECT owned.path, owned.verb FROM rules owned
            JOIN rules orphan
                ON orphan.vendor_id IS NULL
                AND orphan.path = owned.path
                AND orphan.verb = owned.verb
            WHERE owned.vendor_id = ?
            ORDER BY owned.id
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend)?;

        if let Some(row) = clash {
            return Err(StoreError::Conflict {
                vendor_id: None,
                path: row.try_get("path").map_err(backend)?,
                verb: row.try_get("verb").map_err(backend)?,
            });
        }

        let result = sqlx::query("DELETE FROM vendors WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "vendor", id });
        }
        tx.commit().await.map_err(backend)?;
        Ok(())
    }

    // Rules

    pub async fn list_rules(&self, filter: &RuleFilter) -> Result<Vec<Rule>, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM rules WHERE 1 = 1", RULE_COLUMNS));
        if let Some(vendor_id) = filter.vendor_id {
            query.push(" AND vendor_id = ").push_bind(vendor_id);
        }
        if let Some(verb) = &filter.verb {
            query.push(" AND verb = ").push_bind(verb.to_uppercase());
        }
        if let Some(action) = &filter.action {
            query.push(" AND action = ").push_bind(action.clone());
        }
        query.push(" ORDER BY created_at, id");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter().map(rule_from_row).collect()
    }

    pub async fn get_rule(&self, id: i64) -> Result<Rule, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => rule_from_row(&row),
            None => Err(StoreError::NotFound { kind: "rule", id }),
        }
    }

    /// Create a fully specified rule from the admin API
    pub async fn insert_rule(&self, draft: RuleDraft) -> Result<Rule, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO rules (vendor_id, hostname, path, verb, action, delay_ms, live_url, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(draft.vendor_id)
        .bind(&draft.hostname)
        .bind(&draft.path)
        .bind(&draft.verb)
        .bind(&draft.action)
        .bind(delay_to_sql(draft.delay_ms))
        .bind(&draft.live_url)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| rule_write_error(e, &draft))?;

        self.get_rule(result.last_insert_rowid()).await
    }

    pub async fn update_rule(&self, id: i64, draft: RuleDraft) -> Result<Rule, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE rules SET
                vendor_id = ?,
                hostname = ?,
                path = ?,
                verb = ?,
                action = ?,
                delay_ms = ?,
                live_url = ?
            WHERE id = ?
            "#,
        )
        .bind(draft.vendor_id)
        .bind(&draft.hostname)
        .bind(&draft.path)
        .bind(&draft.verb)
        .bind(&draft.action)
        .bind(delay_to_sql(draft.delay_ms))
        .bind(&draft.live_url)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| rule_write_error(e, &draft))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "rule", id });
        }
        self.get_rule(id).await
    }

    /// Delete a rule with its variants and substitutions
    pub async fn delete_rule(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "rule", id });
        }
        Ok(())
    }

    // Response variants

    /// Every variant of a rule, active or not
    pub async fn list_variants(&self, rule_id: i64) -> Result<Vec<ResponseVariant>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, body, active FROM response_variants WHERE rule_id = ? ORDER BY id",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(variant_from_row).collect()
    }

    async fn get_variant(&self, id: i64) -> Result<ResponseVariant, StoreError> {
        let row = sqlx::query("SELECT id, rule_id, body, active FROM response_variants WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;

        match row {
            Some(row) => variant_from_row(&row),
            None => Err(StoreError::NotFound { kind: "variant", id }),
        }
    }

    pub async fn create_variant(
        &self,
        rule_id: i64,
        draft: VariantDraft,
    ) -> Result<ResponseVariant, StoreError> {
        let result = sqlx::query(
            "INSERT INTO response_variants (rule_id, body, active) VALUES (?, ?, ?)",
        )
        .bind(rule_id)
        .bind(&draft.body)
        .bind(draft.active)
        .execute(&self.pool)
        .await
        .map_err(|e| missing_rule(e, rule_id))?;

        self.get_variant(result.last_insert_rowid()).await
    }

    pub async fn update_variant(
        &self,
        id: i64,
        draft: VariantDraft,
    ) -> Result<ResponseVariant, StoreError> {
        let result = sqlx::query("UPDATE response_variants SET body = ?, active = ? WHERE id = ?")
            .bind(&draft.body)
            .bind(draft.active)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "variant", id });
        }
        self.get_variant(id).await
    }

    pub async fn delete_variant(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM response_variants WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "variant", id });
        }
        Ok(())
    }

    // Substitutions

    /// Every substitution of a rule in application order, active or not
    pub async fn list_substitutions(&self, rule_id: i64) -> Result<Vec<Substitution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_id, position, find, replace, active FROM substitutions
            WHERE rule_id = ?
            ORDER BY position, id
            "#,
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(substitution_from_row).collect()
    }

    async fn get_substitution(&self, id: i64) -> Result<Substitution, StoreError> {
        let row = sqlx::query(
            "SELECT id, rule_id, position, find, replace, active FROM substitutions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => substitution_from_row(&row),
            None => Err(StoreError::NotFound { kind: "substitution", id }),
        }
    }

    pub async fn create_substitution(
        &self,
        rule_id: i64,
        draft: SubstitutionDraft,
    ) -> Result<Substitution, StoreError> {
        let result = sqlx::query(
            "INSERT INTO substitutions (rule_id, position, find, replace, active) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(rule_id)
        .bind(draft.position)
        .bind(&draft.find)
        .bind(&draft.replace)
        .bind(draft.active)
        .execute(&self.pool)
        .await
        .map_err(|e| missing_rule(e, rule_id))?;

        self.get_substitution(result.last_insert_rowid()).await
    }

    pub async fn update_substitution(
        &self,
        id: i64,
        draft: SubstitutionDraft,
    ) -> Result<Substitution, StoreError> {
        let result = sqlx::query(
            "UPDATE substitutions SET position = ?, find = ?, replace = ?, active = ? WHERE id = ?",
        )
        .bind(draft.position)
        .bind(&draft.find)
        .bind(&draft.replace)
        .bind(draft.active)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "substitution", id });
        }
        self.get_substitution(id).await
    }

    pub async fn delete_substitution(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM substitutions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind: "substitution", id });
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for Database {
    async fn find_vendors_by_hostname(&self, hostname: &str) -> Result<Vec<Vendor>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, base_url, override_instructions FROM vendors WHERE base_url = ? ORDER BY id",
        )
        .bind(hostname)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(vendor_from_row).collect()
    }

    async fn find_rules(
        &self,
        vendor_id: Option<i64>,
        path: &str,
        verb: &str,
    ) -> Result<Vec<Rule>, StoreError> {
        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM rules WHERE path = ", RULE_COLUMNS));
        query.push_bind(path).push(" AND verb = ").push_bind(verb);
        // Without a vendor the lookup spans every vendor's rules
        if let Some(vendor_id) = vendor_id {
            query.push(" AND vendor_id = ").push_bind(vendor_id);
        }
        query.push(" ORDER BY id");

        let rows = query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn create_rule(&self, new_rule: NewRule) -> Result<Rule, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO rules (vendor_id, hostname, path, verb, action, created_at)
            VALUES (?, ?, ?, ?, '', ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(new_rule.vendor_id)
        .bind(&new_rule.hostname)
        .bind(&new_rule.path)
        .bind(&new_rule.verb)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                vendor_id: new_rule.vendor_id,
                path: new_rule.path,
                verb: new_rule.verb,
            });
        }
        self.get_rule(result.last_insert_rowid()).await
    }

    async fn list_active_variants(&self, rule_id: i64) -> Result<Vec<ResponseVariant>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, rule_id, body, active FROM response_variants WHERE rule_id = ? AND active = 1 ORDER BY id",
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(variant_from_row).collect()
    }

    async fn list_active_substitutions(
        &self,
        rule_id: i64,
    ) -> Result<Vec<Substitution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, rule_id, position, find, replace, active FROM substitutions
            WHERE rule_id = ? AND active = 1
            ORDER BY position, id
            "#,
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(substitution_from_row).collect()
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn rule_write_error(e: sqlx::Error, draft: &RuleDraft) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
            vendor_id: draft.vendor_id,
            path: draft.path.clone(),
            verb: draft.verb.clone(),
        },
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound {
            kind: "vendor",
            id: draft.vendor_id.unwrap_or_default(),
        },
        _ => backend(e),
    }
}

fn missing_rule(e: sqlx::Error, rule_id: i64) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound {
            kind: "rule",
            id: rule_id,
        },
        _ => backend(e),
    }
}

fn delay_to_sql(delay_ms: Option<u64>) -> Option<i64> {
    delay_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX))
}

fn vendor_from_row(row: &SqliteRow) -> Result<Vendor, StoreError> {
    Ok(Vendor {
        id: row.try_get("id").map_err(backend)?,
        name: row.try_get("name").map_err(backend)?,
        base_url: row.try_get("base_url").map_err(backend)?,
        override_instructions: row.try_get("override_instructions").map_err(backend)?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule, StoreError> {
    let delay_ms: Option<i64> = row.try_get("delay_ms").map_err(backend)?;
    let created_at: i64 = row.try_get("created_at").map_err(backend)?;

    Ok(Rule {
        id: row.try_get("id").map_err(backend)?,
        vendor_id: row.try_get("vendor_id").map_err(backend)?,
        hostname: row.try_get("hostname").map_err(backend)?,
        path: row.try_get("path").map_err(backend)?,
        verb: row.try_get("verb").map_err(backend)?,
        action: row.try_get("action").map_err(backend)?,
        delay_ms: delay_ms.map(|ms| u64::try_from(ms).unwrap_or(0)),
        live_url: row.try_get("live_url").map_err(backend)?,
        created_at: chrono::DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
    })
}

fn variant_from_row(row: &SqliteRow) -> Result<ResponseVariant, StoreError> {
    Ok(ResponseVariant {
        id: row.try_get("id").map_err(backend)?,
        rule_id: row.try_get("rule_id").map_err(backend)?,
        body: row.try_get("body").map_err(backend)?,
        active: row.try_get("active").map_err(backend)?,
    })
}

fn substitution_from_row(row: &SqliteRow) -> Result<Substitution, StoreError> {
    Ok(Substitution {
        id: row.try_get("id").map_err(backend)?,
        rule_id: row.try_get("rule_id").map_err(backend)?,
        position: row.try_get("position").map_err(backend)?,
        find: row.try_get("find").map_err(backend)?,
        replace: row.try_get("replace").map_err(backend)?,
        active: row.try_get("active").map_err(backend)?,
    })
}
