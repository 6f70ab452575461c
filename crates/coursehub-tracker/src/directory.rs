//! SQLite-backed course catalogue: managers, facilitators, modules and the
//! course offerings that tie them together.

use coursehub_core::directory::{Assignment, Contact, Directory};
use coursehub_core::{CourseHubError, Result};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Catalogue database.
pub struct SqliteDirectory {
    conn: Mutex<Connection>,
}

impl SqliteDirectory {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CourseHubError::Database(format!("DB open error: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| CourseHubError::Database(format!("DB pragma error: {e}")))?;
        let dir = Self {
            conn: Mutex::new(conn),
        };
        dir.migrate()?;
        Ok(dir)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS managers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS facilitators (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                manager_id TEXT REFERENCES managers(id)
            );

            CREATE TABLE IF NOT EXISTS modules (
                id TEXT PRIMARY KEY,
                code TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS course_offerings (
                id TEXT PRIMARY KEY,
                module_id TEXT NOT NULL REFERENCES modules(id),
                facilitator_id TEXT NOT NULL REFERENCES facilitators(id),
                manager_id TEXT NOT NULL REFERENCES managers(id)
            );
            CREATE INDEX IF NOT EXISTS idx_offerings_facilitator ON course_offerings (facilitator_id);
            ",
            )
            .map_err(|e| CourseHubError::Database(format!("Migration: {e}")))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CourseHubError::Database("directory connection poisoned".into()))
    }

    fn write(&self, what: &str, sql: &str, values: &[&dyn rusqlite::ToSql]) -> Result<()> {
        self.lock()?
            .execute(sql, values)
            .map_err(|e| CourseHubError::Database(format!("Save {what}: {e}")))?;
        Ok(())
    }

    pub fn upsert_manager(&self, id: &str, name: &str, email: &str) -> Result<()> {
        self.write(
            "manager",
            "INSERT INTO managers (id, name, email) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email",
            params![id, name, email],
        )
    }

    pub fn upsert_facilitator(
        &self,
        id: &str,
        name: &str,
        email: &str,
        manager_id: Option<&str>,
    ) -> Result<()> {
        self.write(
            "facilitator",
            "INSERT INTO facilitators (id, name, email, manager_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, email = excluded.email,
                 manager_id = excluded.manager_id",
            params![id, name, email, manager_id],
        )
    }

    pub fn upsert_module(&self, id: &str, code: &str, name: &str) -> Result<()> {
        self.write(
            "module",
            "INSERT INTO modules (id, code, name) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET code = excluded.code, name = excluded.name",
            params![id, code, name],
        )
    }

    pub fn upsert_course_offering(
        &self,
        id: &str,
        module_id: &str,
        facilitator_id: &str,
        manager_id: &str,
    ) -> Result<()> {
        self.write(
            "course offering",
            "INSERT INTO course_offerings (id, module_id, facilitator_id, manager_id) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET module_id = excluded.module_id,
                 facilitator_id = excluded.facilitator_id, manager_id = excluded.manager_id",
            params![id, module_id, facilitator_id, manager_id],
        )
    }

    fn contact(&self, table: &str, kind: &str, id: &str) -> Result<Contact> {
        self.lock()?
            .query_row(
                &format!("SELECT id, name, email FROM {table} WHERE id = ?1"),
                params![id],
                |row| {
                    Ok(Contact {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        email: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(|e| CourseHubError::Database(format!("Get {kind}: {e}")))?
            .ok_or_else(|| CourseHubError::NotFound(format!("{kind} {id}")))
    }
}

impl Directory for SqliteDirectory {
    fn find_assignment(&self, course_offering_id: &str) -> Result<Assignment> {
        self.lock()?
            .query_row(
                "SELECT co.id, co.facilitator_id, co.manager_id, m.name, m.code
                 FROM course_offerings co JOIN modules m ON m.id = co.module_id
                 WHERE co.id = ?1",
                params![course_offering_id],
                |row| {
                    Ok(Assignment {
                        course_offering_id: row.get(0)?,
                        facilitator_id: row.get(1)?,
                        manager_id: row.get(2)?,
                        module_name: row.get(3)?,
                        module_code: row.get(4)?,
                    })
                },
            )
            .optional()
            .map_err(|e| CourseHubError::Database(format!("Get course offering: {e}")))?
            .ok_or_else(|| CourseHubError::NotFound(format!("Course offering {course_offering_id}")))
    }

    fn find_facilitator(&self, facilitator_id: &str) -> Result<Contact> {
        self.contact("facilitators", "Facilitator", facilitator_id)
    }

    fn find_manager(&self, manager_id: &str) -> Result<Contact> {
        self.contact("managers", "Manager", manager_id)
    }

    fn managed_facilitators(&self, manager_id: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM facilitators WHERE manager_id = ?1 ORDER BY id")
            .map_err(|e| CourseHubError::Database(format!("Prepare: {e}")))?;
        let ids = stmt
            .query_map(params![manager_id], |row| row.get::<_, String>(0))
            .map_err(|e| CourseHubError::Database(format!("Query: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| CourseHubError::Database(format!("Row: {e}")))?;
        Ok(ids)
    }
}
