//! Ecosystem resolution: which entity ids a caller may see.
//!
//! Managers, contractors, customers and centers see themselves and everything
//! they own, transitively. Crew see themselves and their center. Warehouses
//! are a separate branch and see themselves plus the contractor they are
//! linked to, if any. Archived entities drop out of every walk.
//!
//! Results are only ever memoised inside a [`RequestScope`]; assignments can
//! change between requests.
use crate::directory::{Directory, Entity};
use crate::error::{PortalError, Result};
use crate::types::{Actor, EntityKind, Role};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecosystem {
    root: String,
    role: Role,
    members: HashSet<String>,
    unbounded: bool,
}

impl Ecosystem {
    /// Admins are not part of the hierarchy and see all of it.
    pub fn unbounded(root: impl Into<String>, role: Role) -> Self {
        Self {
            root: root.into(),
            role,
            members: HashSet::new(),
            unbounded: true,
        }
    }

    pub fn bounded<I, S>(root: impl Into<String>, role: Role, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let root = root.into();
        let mut members: HashSet<String> = members.into_iter().map(Into::into).collect();
        members.insert(root.clone());
        Self {
            root,
            role,
            members,
            unbounded: false,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_unbounded(&self) -> bool {
        self.unbounded
    }

    pub fn contains(&self, id: &str) -> bool {
        self.unbounded || self.members.contains(id)
    }

    pub fn members(&self) -> &HashSet<String> {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && !self.unbounded
    }
}

#[derive(Clone)]
pub struct HierarchyResolver {
    directory: Directory,
}

impl HierarchyResolver {
    pub fn new(directory: Directory) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Fresh per-request cache.
    pub fn scope(&self) -> RequestScope<'_> {
        RequestScope {
            resolver: self,
            cache: HashMap::new(),
        }
    }

    pub fn resolve_ecosystem(&self, entity_id: &str, role: Role) -> Result<Ecosystem> {
        let Some(kind) = role.entity_kind() else {
            return Ok(Ecosystem::unbounded(entity_id, role));
        };
        let root = match self.directory.find(entity_id)? {
            Some(entity) if entity.kind == kind => entity,
            _ => return Err(PortalError::not_found(kind.as_str(), entity_id)),
        };

        let mut members = HashSet::from([root.id.clone()]);
        match role {
            Role::Crew | Role::Warehouse => {
                // unassigned crew and unlinked warehouses simply have no upward segment
                if let Some(owner) = self.active_owner(&root)? {
                    members.insert(owner.id);
                }
            }
            _ => self.collect_descendants(&root.id, &mut members)?,
        }

        Ok(Ecosystem {
            root: root.id,
            role,
            members,
            unbounded: false,
        })
    }

    fn active_owner(&self, entity: &Entity) -> Result<Option<Entity>> {
        let Some(owner_id) = &entity.owner else {
            return Ok(None);
        };
        Ok(self.directory.find(owner_id)?.filter(|o| !o.is_archived()))
    }

    fn collect_descendants(&self, root_id: &str, members: &mut HashSet<String>) -> Result<()> {
        let mut queue = VecDeque::from([root_id.to_string()]);
        while let Some(id) = queue.pop_front() {
            for child in self.directory.children(&id)? {
                if child.is_archived() {
                    continue;
                }
                if members.insert(child.id.clone()) {
                    queue.push_back(child.id);
                }
            }
        }
        Ok(())
    }

    /// Active owners above `entity_id`, nearest first.
    pub fn ancestors(&self, entity_id: &str) -> Result<Vec<Entity>> {
        let mut out = vec![];
        let mut seen = HashSet::from([entity_id.to_string()]);
        let mut cursor = self.directory.get(entity_id)?.owner;
        while let Some(id) = cursor {
            if !seen.insert(id.clone()) {
                break;
            }
            let Some(entity) = self.directory.find(&id)? else {
                break;
            };
            cursor = entity.owner.clone();
            if !entity.is_archived() {
                out.push(entity);
            }
        }
        Ok(out)
    }

    /// First active ancestor of the given kind.
    pub fn ancestor_of_kind(&self, entity_id: &str, kind: EntityKind) -> Result<Option<Entity>> {
        Ok(self
            .ancestors(entity_id)?
            .into_iter()
            .find(|e| e.kind == kind))
    }
}

/// Request-lifetime memo of resolved ecosystems. Drop it with the request.
pub struct RequestScope<'r> {
    resolver: &'r HierarchyResolver,
    cache: HashMap<(String, Role), Arc<Ecosystem>>,
}

impl RequestScope<'_> {
    pub fn ecosystem(&mut self, entity_id: &str, role: Role) -> Result<Arc<Ecosystem>> {
        let key = (entity_id.to_string(), role);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Arc::clone(hit));
        }
        let resolved = Arc::new(self.resolver.resolve_ecosystem(entity_id, role)?);
        self.cache.insert(key, Arc::clone(&resolved));
        Ok(resolved)
    }

    pub fn ecosystem_of(&mut self, actor: &Actor) -> Result<Arc<Ecosystem>> {
        self.ecosystem(&actor.user_id, actor.role)
    }

    pub fn resolver(&self) -> &HierarchyResolver {
        self.resolver
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
