use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::codec::{ObjectBuilder, Value};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ProjectStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Stopped => "stopped",
            ProjectStatus::Starting => "starting",
            ProjectStatus::Running => "running",
            ProjectStatus::Error => "error",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "stopped" => ProjectStatus::Stopped,
            "starting" => ProjectStatus::Starting,
            "running" => ProjectStatus::Running,
            "error" => ProjectStatus::Error,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub binary_path: PathBuf,
    pub socket_path: PathBuf,
    pub status: ProjectStatus,
    pub pid: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        binary_path: impl Into<PathBuf>,
        sockets_dir: impl AsRef<Path>,
        now_ms: i64,
    ) -> Self {
        let id = Uuid::new_v4();
        let socket_path = sockets_dir.as_ref().join(format!("{id}.sock"));
        Self {
            id,
            name: name.into(),
            binary_path: binary_path.into(),
            socket_path,
            status: ProjectStatus::Stopped,
            pid: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

/// `[A-Za-z0-9][A-Za-z0-9_-]{0,62}`, 1..=63 printable bytes total.
pub fn validate_project_name(name: &str) -> Result<(), CoreError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return Err(CoreError::Validation(format!(
            "project name length must be 1..=63 bytes, got {}",
            bytes.len()
        )));
    }
    if !bytes[0].is_ascii_alphanumeric() {
        return Err(CoreError::Validation(
            "project name must start with a letter or digit".to_string(),
        ));
    }
    if !bytes[1..]
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(CoreError::Validation(
            "project name may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

impl From<&Project> for Value {
    fn from(project: &Project) -> Value {
        ObjectBuilder::new()
            .field("id", Value::Uuid(project.id))
            .field("name", Value::Str(project.name.clone()))
            .field(
                "binary_path",
                Value::Str(project.binary_path.to_string_lossy().into_owned()),
            )
            .field(
                "socket_path",
                Value::Str(project.socket_path.to_string_lossy().into_owned()),
            )
            .field("status", Value::Str(project.status.as_str().to_string()))
            .field(
                "pid",
                project.pid.map(|p| Value::UInt(p as u64)).unwrap_or(Value::Null),
            )
            .field("created_at", Value::Date(project.created_at))
            .field("updated_at", Value::Date(project.updated_at))
            .build()
    }
}

impl TryFrom<&Value> for Project {
    type Error = CoreError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        let field = |key: &str| {
            value
                .get(key)
                .ok_or_else(|| CoreError::Corruption(format!("project record missing '{key}'")))
        };
        let status_str = field("status")?
            .as_str()
            .ok_or_else(|| CoreError::Corruption("project 'status' is not a string".into()))?;
        let status = ProjectStatus::from_str(status_str)
            .ok_or_else(|| CoreError::Corruption(format!("unknown project status '{status_str}'")))?;
        let pid = match field("pid")? {
            Value::Null => None,
            v => Some(v.as_u64().ok_or_else(|| {
                CoreError::Corruption("project 'pid' is not an integer".into())
            })? as u32),
        };
        Ok(Project {
            id: field("id")?
                .as_uuid()
                .ok_or_else(|| CoreError::Corruption("project 'id' is not a uuid".into()))?,
            name: field("name")?
                .as_str()
                .ok_or_else(|| CoreError::Corruption("project 'name' is not a string".into()))?
                .to_owned(),
            binary_path: PathBuf::from(
                field("binary_path")?
                    .as_str()
                    .ok_or_else(|| CoreError::Corruption("project 'binary_path' is not a string".into()))?,
            ),
            socket_path: PathBuf::from(
                field("socket_path")?
                    .as_str()
                    .ok_or_else(|| CoreError::Corruption("project 'socket_path' is not a string".into()))?,
            ),
            status,
            pid,
            created_at: field("created_at")?
                .as_date_ms()
                .ok_or_else(|| CoreError::Corruption("project 'created_at' is not a date".into()))?,
            updated_at: field("updated_at")?
                .as_date_ms()
                .ok_or_else(|| CoreError::Corruption("project 'updated_at' is not a date".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn roundtrip_through_value() {
        let mut project = Project::new("demo-app", "/srv/projects/demo", "/srv/sockets", 1_700_000_000_000);
        project.status = ProjectStatus::Running;
        project.pid = Some(4242);
        let value = Value::from(&project);
        let decoded = Project::try_from(&value).unwrap();
        assert_eq!(project, decoded);
    }

    #[test]
    fn roundtrip_without_pid() {
        let project = Project::new("demo-app", "/srv/projects/demo", "/srv/sockets", 1_700_000_000_000);
        let value = Value::from(&project);
        let decoded = Project::try_from(&value).unwrap();
        assert_eq!(decoded.pid, None);
    }

    #[test]
    fn validates_name_charset() {
        assert!(validate_project_name("demo-app_1").is_ok());
        assert!(validate_project_name("_leading-underscore").is_err());
        assert!(validate_project_name("").is_err());
        assert!(validate_project_name(&"a".repeat(64)).is_err());
        assert!(validate_project_name("bad space").is_err());
    }
}
