use crate::models::{AccountRow, NewAccount, OtpCheck, OtpDeviceRow};
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, Row, params};

const ACCOUNT_COLUMNS: &str = "id, email, first_name, last_name, password, role, is_active, is_staff, is_otp_verified, date_joined";

const DEVICE_COLUMNS: &str = "id, user_id, name, secret, confirmed, last_challenge_at, last_verified_step, failure_count, last_failure_at";

impl Database {
    // -- Accounts --

    /// Returns false when the email is already taken.
    pub fn create_account(&self, account: &NewAccount<'_>) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (id, email, first_name, last_name, password, role, is_active, is_staff)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    account.id,
                    account.email,
                    account.first_name,
                    account.last_name,
                    account.password,
                    account.role,
                    account.is_active,
                    account.is_staff,
                ],
            );

            match inserted {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "email", email))
    }

    pub fn get_account_by_id(&self, id: &str) -> Result<Option<AccountRow>> {
        self.with_conn(|conn| query_account(conn, "id", id))
    }

    /// Returns false when no account has this id.
    pub fn update_account_role(&self, id: &str, role: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute("UPDATE accounts SET role = ?1 WHERE id = ?2", params![role, id])?;
            Ok(changed == 1)
        })
    }

    /// Gives an existing account full admin standing: active, staff, admin role.
    pub fn promote_to_admin(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE accounts SET role = 'admin', is_active = 1, is_staff = 1 WHERE id = ?1",
                [id],
            )?;
            Ok(changed == 1)
        })
    }

    // -- OTP devices --

    /// Fetch the account's device by name, creating a confirmed one without a
    /// secret if absent. Returns (device, created).
    pub fn get_or_create_otp_device(
        &self,
        id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<(OtpDeviceRow, bool)> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO otp_devices (id, user_id, name, confirmed) VALUES (?1, ?2, ?3, 1)",
                params![id, user_id, name],
            )?;

            let device = query_device(conn, user_id, name)?
                .ok_or_else(|| anyhow::anyhow!("OTP device for {} missing after insert", user_id))?;

            Ok((device, inserted == 1))
        })
    }

    pub fn get_confirmed_otp_device(&self, user_id: &str, name: &str) -> Result<Option<OtpDeviceRow>> {
        self.with_conn(|conn| {
            Ok(query_device(conn, user_id, name)?.filter(|device| device.confirmed))
        })
    }

    /// Store the device secret unless one is already set. Returns whether the
    /// write happened.
    pub fn set_otp_secret(&self, device_id: &str, secret: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE otp_devices SET secret = ?1 WHERE id = ?2 AND secret = ''",
                params![secret, device_id],
            )?;
            Ok(changed == 1)
        })
    }

    pub fn record_otp_challenge(&self, device_id: &str, at: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE otp_devices SET last_challenge_at = ?1 WHERE id = ?2",
                params![at, device_id],
            )?;
            Ok(())
        })
    }

    /// Run one verification attempt while holding the connection, so the
    /// lockout check, the step bookkeeping and the failure count all see the
    /// same device state. `throttled` and `matching_step` get the device as
    /// currently stored.
    pub fn attempt_otp_verification<T, M>(
        &self,
        device_id: &str,
        now: i64,
        throttled: T,
        matching_step: M,
    ) -> Result<OtpCheck>
    where
        T: FnOnce(&OtpDeviceRow) -> bool,
        M: FnOnce(&OtpDeviceRow) -> Result<Option<i64>>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let device = query_device_by_id(&tx, device_id)?
                .ok_or_else(|| anyhow::anyhow!("OTP device {} not found", device_id))?;
            if throttled(&device) {
                return Ok(OtpCheck::Throttled);
            }

            let consumed = match matching_step(&device)? {
                Some(step) => consume_step(&tx, device_id, step)?,
                None => false,
            };

            let outcome = if consumed {
                OtpCheck::Accepted
            } else {
                tx.execute(
                    "UPDATE otp_devices SET failure_count = failure_count + 1, last_failure_at = ?1 WHERE id = ?2",
                    params![now, device_id],
                )?;
                OtpCheck::Rejected {
                    failures: device.failure_count.saturating_add(1),
                }
            };

            tx.commit()?;
            Ok(outcome)
        })
    }

    /// Consume `step`, clear throttling and mark the owning account active and
    /// verified, atomically. Returns false, changing nothing, unless `step` is
    /// newer than the last consumed one.
    pub fn complete_otp_verification(&self, device_id: &str, step: i64) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let consumed = consume_step(&tx, device_id, step)?;
            tx.commit()?;
            Ok(consumed)
        })
    }
}

fn consume_step(conn: &Connection, device_id: &str, step: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE otp_devices
         SET last_verified_step = ?1, failure_count = 0, last_failure_at = NULL
         WHERE id = ?2 AND (last_verified_step IS NULL OR last_verified_step < ?1)",
        params![step, device_id],
    )?;
    if changed == 0 {
        return Ok(false);
    }

    conn.execute(
        "UPDATE accounts SET is_active = 1, is_otp_verified = 1
         WHERE id = (SELECT user_id FROM otp_devices WHERE id = ?1)",
        [device_id],
    )?;
    Ok(true)
}

fn query_account(conn: &Connection, column: &str, value: &str) -> Result<Option<AccountRow>> {
    // `column` is always one of our own literals, never user input.
    let sql = format!("SELECT {} FROM accounts WHERE {} = ?1", ACCOUNT_COLUMNS, column);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt.query_row([value], map_account).optional()?;
    Ok(row)
}

fn query_device(conn: &Connection, user_id: &str, name: &str) -> Result<Option<OtpDeviceRow>> {
    let sql = format!(
        "SELECT {} FROM otp_devices WHERE user_id = ?1 AND name = ?2",
        DEVICE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt.query_row(params![user_id, name], map_device).optional()?;
    Ok(row)
}

fn query_device_by_id(conn: &Connection, id: &str) -> Result<Option<OtpDeviceRow>> {
    let sql = format!("SELECT {} FROM otp_devices WHERE id = ?1", DEVICE_COLUMNS);
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt.query_row([id], map_device).optional()?;
    Ok(row)
}

fn map_account(row: &Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        id: row.get(0)?,
        email: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        password: row.get(4)?,
        role: row.get(5)?,
        is_active: row.get(6)?,
        is_staff: row.get(7)?,
        is_otp_verified: row.get(8)?,
        date_joined: row.get(9)?,
    })
}

fn map_device(row: &Row<'_>) -> rusqlite::Result<OtpDeviceRow> {
    Ok(OtpDeviceRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        secret: row.get(3)?,
        confirmed: row.get(4)?,
        last_challenge_at: row.get(5)?,
        last_verified_step: row.get(6)?,
        failure_count: row.get(7)?,
        last_failure_at: row.get(8)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
