use crate::core::{Column, Identity, Record, Result, StashError};
use crate::entity::AnyEntity;
use std::fmt;

/// Everything needed to write one entity row without consulting the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityImage {
    pub identity: Identity,
    pub columns: Vec<Column>,
    pub record: Record,
}

impl EntityImage {
    pub(crate) fn capture(entity: &dyn AnyEntity) -> Result<Self> {
        let identity = entity.entity_identity().ok_or_else(|| {
            StashError::InvalidArgument(format!(
                "cannot capture a '{}' entity without an id",
                entity.table()
            ))
        })?;
        Ok(Self {
            identity,
            columns: entity.column_set(),
            record: entity.record(),
        })
    }
}

/// A pending mutation, replayed against the backend at commit.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Create(EntityImage),
    Update(EntityImage),
    Delete(Identity),
    /// Persist `target` and link it from `owner.field`.
    CreateReference {
        owner: Identity,
        field: String,
        target: EntityImage,
    },
    /// Unlink `owner.field` and delete the owned `target` row.
    DeleteReference {
        owner: Identity,
        field: String,
        target: Identity,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    Create,
    Update,
    Delete,
    CreateReference,
    DeleteReference,
}

impl fmt::Display for DirectiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::CreateReference => "create-reference",
            Self::DeleteReference => "delete-reference",
        };
        f.write_str(name)
    }
}

impl Directive {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Self::Create(_) => DirectiveKind::Create,
            Self::Update(_) => DirectiveKind::Update,
            Self::Delete(_) => DirectiveKind::Delete,
            Self::CreateReference { .. } => DirectiveKind::CreateReference,
            Self::DeleteReference { .. } => DirectiveKind::DeleteReference,
        }
    }

    /// The identity whose row this directive writes or removes.
    pub fn subject(&self) -> &Identity {
        match self {
            Self::Create(image) | Self::Update(image) => &image.identity,
            Self::Delete(identity) => identity,
            Self::CreateReference { target, .. } => &target.identity,
            Self::DeleteReference { target, .. } => target,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateReference { owner, field, target } => write!(
                f,
                "{} {}.{} -> {}",
                self.kind(),
                owner,
                field,
                target.identity
            ),
            Self::DeleteReference { owner, field, target } => {
                write!(f, "{} {}.{} -> {}", self.kind(), owner, field, target)
            }
            _ => write!(f, "{} {}", self.kind(), self.subject()),
        }
    }
}
