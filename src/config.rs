use rusqlite::Connection;
use serde_json::{json, Map, Value};

use crate::db;

/// What the schedule generator does when a period has fewer matching
/// weekdays than the classes allocated to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsufficientDatesPolicy {
    Clamp,
    Fail,
}

impl InsufficientDatesPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clamp" => Some(Self::Clamp),
            "fail" => Some(Self::Fail),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clamp => "clamp",
            Self::Fail => "fail",
        }
    }
}

/// Reference date the make-up window is counted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineBasis {
    AbsenceDate,
    EnrollmentEnd,
}

impl DeadlineBasis {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "absence_date" => Some(Self::AbsenceDate),
            "enrollment_end" => Some(Self::EnrollmentEnd),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AbsenceDate => "absence_date",
            Self::EnrollmentEnd => "enrollment_end",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulingConfig {
    pub on_create: InsufficientDatesPolicy,
    pub on_renew: InsufficientDatesPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct PermissionConfig {
    pub monthly_quota: i64,
    pub make_up_window_days: i64,
    pub deadline_basis: DeadlineBasis,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub scheduling: SchedulingConfig,
    pub permissions: PermissionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduling: SchedulingConfig {
                on_create: InsufficientDatesPolicy::Clamp,
                on_renew: InsufficientDatesPolicy::Fail,
            },
            permissions: PermissionConfig {
                monthly_quota: 3,
                make_up_window_days: 15,
                deadline_basis: DeadlineBasis::AbsenceDate,
            },
        }
    }
}

#[derive(Clone, Copy)]
pub enum SetupSection {
    Scheduling,
    Permissions,
}

impl SetupSection {
    pub const ALL: [SetupSection; 2] = [SetupSection::Scheduling, SetupSection::Permissions];

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduling" => Some(Self::Scheduling),
            "permissions" => Some(Self::Permissions),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Scheduling => "scheduling",
            Self::Permissions => "permissions",
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Scheduling => "setup.scheduling",
            Self::Permissions => "setup.permissions",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    let d = EngineConfig::default();
    match section {
        SetupSection::Scheduling => json!({
            "onCreate": d.scheduling.on_create.as_str(),
            "onRenew": d.scheduling.on_renew.as_str(),
        }),
        SetupSection::Permissions => json!({
            "monthlyQuota": d.permissions.monthly_quota,
            "makeUpWindowDays": d.permissions.make_up_window_days,
            "deadlineBasis": d.permissions.deadline_basis.as_str(),
        }),
    }
}

/// Stored section merged over defaults, so sections written by older
/// versions still expose every field.
pub fn section_get(conn: &Connection, section: SetupSection) -> rusqlite::Result<Value> {
    let mut merged = default_section(section);
    if let Some(Value::Object(stored)) = db::settings_get_json(conn, section.key())? {
        if let Some(obj) = merged.as_object_mut() {
            for (k, v) in stored {
                if obj.contains_key(&k) {
                    obj.insert(k, v);
                }
            }
        }
    }
    Ok(merged)
}

pub fn section_update(
    conn: &Connection,
    section: SetupSection,
    patch: &Map<String, Value>,
) -> Result<Value, SetupError> {
    let mut current = section_get(conn, section)?;
    merge_section_patch(section, &mut current, patch).map_err(SetupError::Invalid)?;
    db::settings_set_json(conn, section.key(), &current)?;
    Ok(current)
}

#[derive(Debug)]
pub enum SetupError {
    Invalid(String),
    Db(rusqlite::Error),
}

impl From<rusqlite::Error> for SetupError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Db(e)
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_str<'a>(v: &'a Value, key: &str) -> Result<&'a str, String> {
    v.as_str().ok_or_else(|| format!("{} must be string", key))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Scheduling => match k.as_str() {
                "onCreate" | "onRenew" => {
                    let p = InsufficientDatesPolicy::parse(parse_str(v, k)?)
                        .ok_or_else(|| format!("{} must be one of: clamp, fail", k))?;
                    obj.insert(k.clone(), Value::String(p.as_str().to_string()));
                }
                _ => return Err(format!("unknown scheduling field: {}", k)),
            },
            SetupSection::Permissions => match k.as_str() {
                "monthlyQuota" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 31)?));
                }
                "makeUpWindowDays" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 365)?));
                }
                "deadlineBasis" => {
                    let b = DeadlineBasis::parse(parse_str(v, k)?).ok_or_else(|| {
                        "deadlineBasis must be one of: absence_date, enrollment_end".to_string()
                    })?;
                    obj.insert(k.clone(), Value::String(b.as_str().to_string()));
                }
                _ => return Err(format!("unknown permissions field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Typed engine configuration for the current workspace.
pub fn load(conn: &Connection) -> rusqlite::Result<EngineConfig> {
    let mut cfg = EngineConfig::default();

    let sched = section_get(conn, SetupSection::Scheduling)?;
    if let Some(p) = sched
        .get("onCreate")
        .and_then(|v| v.as_str())
        .and_then(InsufficientDatesPolicy::parse)
    {
        cfg.scheduling.on_create = p;
    }
    if let Some(p) = sched
        .get("onRenew")
        .and_then(|v| v.as_str())
        .and_then(InsufficientDatesPolicy::parse)
    {
        cfg.scheduling.on_renew = p;
    }

    let perms = section_get(conn, SetupSection::Permissions)?;
    if let Some(n) = perms.get("monthlyQuota").and_then(|v| v.as_i64()) {
        cfg.permissions.monthly_quota = n;
    }
    if let Some(n) = perms.get("makeUpWindowDays").and_then(|v| v.as_i64()) {
        cfg.permissions.make_up_window_days = n;
    }
    if let Some(b) = perms
        .get("deadlineBasis")
        .and_then(|v| v.as_str())
        .and_then(DeadlineBasis::parse)
    {
        cfg.permissions.deadline_basis = b;
    }

    Ok(cfg)
}
