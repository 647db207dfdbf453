//! The object store: a flat region keyed by object id, with hash-bucket
//! population counts driving id assignment. All inter-object references are
//! ids into this region, never owning pointers, so the parent/child/sibling
//! and hard-link cross-links cannot form ownership cycles.

use crate::lffs_lib::desc::*;
use crate::lffs_lib::tnodes::TnodeTree;
use crate::lffs_lib::types::{FsError, FsResult, ObjectId, PhysChunk};
use crate::lffs_lib::utils::{name_checksum, names_equal};
use log::*;
use rand::Rng;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct FileVariant {
    pub tnodes: TnodeTree,
    pub file_size: u64,
    /// High-water mark of data actually written.
    pub stored_size: u64,
    /// Smallest size this file has been truncated to while a header was
    /// live; u64::MAX until the first shrink.
    pub shrink_size: u64,
    pub n_data_chunks: u32,
}

impl FileVariant {
    pub fn new() -> Self {
        Self {
            shrink_size: u64::MAX,
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct DirVariant {
    pub children: Vec<ObjectId>,
}

#[derive(Debug)]
pub enum ObjectVariant {
    File(FileVariant),
    Directory(DirVariant),
    Symlink { alias: String },
    Hardlink { equiv_id: ObjectId },
    Special { rdev: u32 },
}

impl ObjectVariant {
    pub fn for_type(obj_type: ObjectType) -> Self {
        match obj_type {
            ObjectType::Directory => ObjectVariant::Directory(DirVariant::default()),
            ObjectType::Symlink => ObjectVariant::Symlink { alias: String::new() },
            ObjectType::Hardlink => ObjectVariant::Hardlink { equiv_id: 0 },
            ObjectType::Special => ObjectVariant::Special { rdev: 0 },
            // scan creates not-yet-typed objects as files
            ObjectType::File | ObjectType::Unknown => ObjectVariant::File(FileVariant::new()),
        }
    }

    pub fn obj_type(&self) -> ObjectType {
        match self {
            ObjectVariant::File(_) => ObjectType::File,
            ObjectVariant::Directory(_) => ObjectType::Directory,
            ObjectVariant::Symlink { .. } => ObjectType::Symlink,
            ObjectVariant::Hardlink { .. } => ObjectType::Hardlink,
            ObjectVariant::Special { .. } => ObjectType::Special,
        }
    }
}

#[derive(Debug)]
pub struct Object {
    pub id: ObjectId,
    /// 0 when the object has no parent (pseudo dirs, scan orphans).
    pub parent: ObjectId,
    /// Inline name; None while only the checksum is known (long names are
    /// lazily re-read from the header chunk).
    pub name: Option<String>,
    pub name_checksum: u16,
    pub lazy_name: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Physical chunk of the live object header, if one has been written.
    pub hdr_chunk: Option<PhysChunk>,
    pub serial: u8,
    /// Header needs rewriting.
    pub dirty: bool,
    pub unlinked: bool,
    pub deleted: bool,
    /// Data chunks released by accounting only; GC finishes the job.
    pub soft_del: bool,
    /// Hard-link objects whose target is this object.
    pub hard_links: Vec<ObjectId>,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub variant: ObjectVariant,
}

impl Object {
    pub fn new(id: ObjectId, obj_type: ObjectType) -> Self {
        Self {
            id,
            parent: 0,
            name: None,
            name_checksum: 0,
            lazy_name: false,
            mode: 0,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            hdr_chunk: None,
            serial: 0,
            dirty: false,
            unlinked: false,
            deleted: false,
            soft_del: false,
            hard_links: Vec::new(),
            xattrs: Vec::new(),
            variant: ObjectVariant::for_type(obj_type),
        }
    }

    fn new_fake_dir(id: ObjectId, name: &str) -> Self {
        let mut obj = Object::new(id, ObjectType::Directory);
        obj.mode = 0o40700;
        obj.set_name(name, false);
        obj
    }

    pub fn obj_type(&self) -> ObjectType {
        self.variant.obj_type()
    }

    pub fn is_pseudo(&self) -> bool {
        (OBJECTID_UNLINKED..=OBJECTID_LOST_N_FOUND).contains(&self.id)
    }

    pub fn set_name(&mut self, name: &str, fold_case: bool) {
        self.name_checksum = name_checksum(name, fold_case);
        self.name = Some(name.to_string());
        self.lazy_name = false;
    }

    pub fn file(&self) -> FsResult<&FileVariant> {
        match &self.variant {
            ObjectVariant::File(f) => Ok(f),
            _ => Err(FsError::BadHandle),
        }
    }

    pub fn file_mut(&mut self) -> FsResult<&mut FileVariant> {
        match &mut self.variant {
            ObjectVariant::File(f) => Ok(f),
            _ => Err(FsError::BadHandle),
        }
    }

    pub fn dir(&self) -> FsResult<&DirVariant> {
        match &self.variant {
            ObjectVariant::Directory(d) => Ok(d),
            _ => Err(FsError::NotDir),
        }
    }

    pub fn dir_mut(&mut self) -> FsResult<&mut DirVariant> {
        match &mut self.variant {
            ObjectVariant::Directory(d) => Ok(d),
            _ => Err(FsError::NotDir),
        }
    }
}

/// Attribute record handed out by stat.
#[derive(Debug, Clone)]
pub struct ObjectAttr {
    pub id: ObjectId,
    pub obj_type: ObjectType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub size: u64,
    pub n_links: u32,
    pub rdev: u32,
}

pub struct ObjectTable {
    objects: HashMap<ObjectId, Object>,
    bucket_counts: Vec<u32>,
}

impl ObjectTable {
    pub fn new() -> Self {
        let mut table = Self {
            objects: HashMap::new(),
            bucket_counts: vec![0; N_BUCKETS],
        };
        table.insert(Object::new_fake_dir(OBJECTID_UNLINKED, "unlinked"));
        table.insert(Object::new_fake_dir(OBJECTID_DELETED, "deleted"));
        table.insert(Object::new_fake_dir(OBJECTID_ROOT, ""));
        let mut lost = Object::new_fake_dir(OBJECTID_LOST_N_FOUND, "lost+found");
        lost.parent = OBJECTID_ROOT;
        table.insert(lost);
        table
            .add_child(OBJECTID_ROOT, OBJECTID_LOST_N_FOUND)
            .expect("root is a directory");
        table
    }

    fn bucket_of(id: ObjectId) -> usize {
        (id as usize) % N_BUCKETS
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(&id)
    }

    pub fn require(&self, id: ObjectId) -> FsResult<&Object> {
        self.objects.get(&id).ok_or(FsError::BadHandle)
    }

    pub fn require_mut(&mut self, id: ObjectId) -> FsResult<&mut Object> {
        self.objects.get_mut(&id).ok_or(FsError::BadHandle)
    }

    pub fn insert(&mut self, obj: Object) {
        let id = obj.id;
        if self.objects.insert(id, obj).is_none() {
            self.bucket_counts[Self::bucket_of(id)] += 1;
        }
    }

    pub fn remove(&mut self, id: ObjectId) -> Option<Object> {
        let removed = self.objects.remove(&id);
        if removed.is_some() {
            self.bucket_counts[Self::bucket_of(id)] -= 1;
        }
        removed
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.objects.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    /// Pick an unused object id: probe a handful of random buckets for the
    /// least-populated one, then stride through that bucket's id sequence
    /// until a free value turns up. Uniqueness only ever needs a bucket-local
    /// check because ids in one bucket differ by multiples of N_BUCKETS.
    pub fn alloc_id(&self) -> FsResult<ObjectId> {
        let mut rng = rand::thread_rng();
        let mut best = rng.gen_range(0..N_BUCKETS);
        for _ in 1..BUCKET_PROBES {
            let probe = rng.gen_range(0..N_BUCKETS);
            if self.bucket_counts[probe] < self.bucket_counts[best] {
                best = probe;
            }
        }
        let mut candidate = best as u32;
        loop {
            if candidate >= ID_RESERVED_TOP {
                return Err(FsError::NoMemory);
            }
            if candidate >= FIRST_ALLOCATABLE_ID && !self.contains(candidate) {
                return Ok(candidate);
            }
            candidate += N_BUCKETS as u32;
        }
    }

    pub fn add_child(&mut self, dir: ObjectId, child: ObjectId) -> FsResult<()> {
        let d = self.require_mut(dir)?.dir_mut()?;
        if !d.children.contains(&child) {
            d.children.push(child);
        }
        self.require_mut(child)?.parent = dir;
        Ok(())
    }

    pub fn remove_child(&mut self, dir: ObjectId, child: ObjectId) -> FsResult<()> {
        let d = self.require_mut(dir)?.dir_mut()?;
        d.children.retain(|c| *c != child);
        if let Some(obj) = self.get_mut(child) {
            if obj.parent == dir {
                obj.parent = 0;
            }
        }
        Ok(())
    }

    /// Children of `dir` whose name checksum matches; the caller loads any
    /// lazy names among them before the exact compare.
    pub fn children_with_checksum(&self, dir: ObjectId, sum: u16) -> FsResult<Vec<ObjectId>> {
        let d = self.require(dir)?.dir()?;
        Ok(d.children
            .iter()
            .copied()
            .filter(|c| {
                self.get(*c)
                    .map(|obj| obj.name_checksum == sum)
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Exact name lookup among checksum candidates. All candidate names must
    /// already be loaded.
    pub fn find_child_by_name(
        &self,
        dir: ObjectId,
        name: &str,
        fold_case: bool,
    ) -> FsResult<Option<ObjectId>> {
        let sum = name_checksum(name, fold_case);
        for id in self.children_with_checksum(dir, sum)? {
            let obj = self.require(id)?;
            match &obj.name {
                Some(n) if names_equal(n, name, fold_case) => return Ok(Some(id)),
                Some(_) => {}
                None => {
                    return Err(FsError::Fatal(format!(
                        "name of object {} not loaded before compare",
                        id
                    )))
                }
            }
        }
        Ok(None)
    }

    /// Resolve a hard link to its target; at most one hop.
    pub fn equivalent(&self, id: ObjectId) -> FsResult<ObjectId> {
        let obj = self.require(id)?;
        match &obj.variant {
            ObjectVariant::Hardlink { equiv_id } => {
                let target = self.require(*equiv_id)?;
                if matches!(target.variant, ObjectVariant::Hardlink { .. }) {
                    return Err(FsError::Fatal(format!("hard-link chain at object {}", id)));
                }
                Ok(*equiv_id)
            }
            _ => Ok(id),
        }
    }

    /// Wire a hard-link object into its target's link list.
    pub fn register_hardlink(&mut self, link_id: ObjectId) -> FsResult<()> {
        let equiv = match &self.require(link_id)?.variant {
            ObjectVariant::Hardlink { equiv_id } => *equiv_id,
            _ => return Err(FsError::BadHandle),
        };
        let target = self.require_mut(equiv)?;
        if !target.hard_links.contains(&link_id) {
            target.hard_links.push(link_id);
        }
        Ok(())
    }

    pub fn unregister_hardlink(&mut self, link_id: ObjectId) {
        let equiv = match self.get(link_id).map(|o| &o.variant) {
            Some(ObjectVariant::Hardlink { equiv_id }) => *equiv_id,
            _ => return,
        };
        if let Some(target) = self.get_mut(equiv) {
            target.hard_links.retain(|l| *l != link_id);
        }
    }

    /// Steps to reach ROOT via parent pointers, or None when the chain is
    /// broken or too deep.
    pub fn depth_to_root(&self, id: ObjectId) -> Option<usize> {
        let mut cur = id;
        for depth in 0..MAX_OBJECT_DEPTH {
            if cur == OBJECTID_ROOT {
                return Some(depth);
            }
            cur = self.get(cur)?.parent;
            if cur == 0 {
                return None;
            }
        }
        None
    }

    pub fn attr_of(&self, id: ObjectId) -> FsResult<ObjectAttr> {
        let obj = self.require(id)?;
        let (size, rdev) = match &obj.variant {
            ObjectVariant::File(f) => (f.file_size, 0),
            ObjectVariant::Symlink { alias } => (alias.len() as u64, 0),
            ObjectVariant::Special { rdev } => (0, *rdev),
            _ => (0, 0),
        };
        Ok(ObjectAttr {
            id: obj.id,
            obj_type: obj.obj_type(),
            mode: obj.mode,
            uid: obj.uid,
            gid: obj.gid,
            atime: obj.atime,
            mtime: obj.mtime,
            ctime: obj.ctime,
            size,
            n_links: 1 + obj.hard_links.len() as u32,
            rdev,
        })
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Log the table shape; handy when debugging scan results.
pub fn dump_table(table: &ObjectTable) {
    for obj in table.iter() {
        debug!(
            "obj {} type {:?} parent {} name {:?} hdr {:?}",
            obj.id,
            obj.obj_type(),
            obj.parent,
            obj.name,
            obj.hdr_chunk
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_dirs_exist() {
        let table = ObjectTable::new();
        assert_eq!(table.len(), 4);
        for id in [OBJECTID_UNLINKED, OBJECTID_DELETED, OBJECTID_ROOT, OBJECTID_LOST_N_FOUND] {
            assert!(table.get(id).unwrap().is_pseudo());
        }
        // lost+found is visible under root
        let root = table.get(OBJECTID_ROOT).unwrap().dir().unwrap();
        assert_eq!(root.children, vec![OBJECTID_LOST_N_FOUND]);
    }

    #[test]
    fn alloc_id_avoids_reserved_and_used() {
        let mut table = ObjectTable::new();
        for _ in 0..64 {
            let id = table.alloc_id().unwrap();
            assert!(id >= FIRST_ALLOCATABLE_ID);
            assert!(id < ID_RESERVED_TOP);
            assert!(!table.contains(id));
            table.insert(Object::new(id, ObjectType::File));
        }
    }

    #[test]
    fn name_lookup_uses_checksum_prefilter() {
        let mut table = ObjectTable::new();
        let id = table.alloc_id().unwrap();
        let mut obj = Object::new(id, ObjectType::File);
        obj.set_name("hello.txt", false);
        table.insert(obj);
        table.add_child(OBJECTID_ROOT, id).unwrap();
        assert_eq!(
            table.find_child_by_name(OBJECTID_ROOT, "hello.txt", false).unwrap(),
            Some(id)
        );
        assert_eq!(table.find_child_by_name(OBJECTID_ROOT, "other", false).unwrap(), None);
    }

    #[test]
    fn case_insensitive_lookup() {
        let mut table = ObjectTable::new();
        let id = table.alloc_id().unwrap();
        let mut obj = Object::new(id, ObjectType::File);
        obj.set_name("MiXeD", true);
        table.insert(obj);
        table.add_child(OBJECTID_ROOT, id).unwrap();
        assert_eq!(
            table.find_child_by_name(OBJECTID_ROOT, "mixed", true).unwrap(),
            Some(id)
        );
    }

    #[test]
    fn hardlink_equivalent_single_hop() {
        let mut table = ObjectTable::new();
        let target = table.alloc_id().unwrap();
        table.insert(Object::new(target, ObjectType::File));
        let link = table.alloc_id().unwrap();
        let mut lobj = Object::new(link, ObjectType::Hardlink);
        lobj.variant = ObjectVariant::Hardlink { equiv_id: target };
        table.insert(lobj);
        table.register_hardlink(link).unwrap();
        assert_eq!(table.equivalent(link).unwrap(), target);
        assert_eq!(table.equivalent(target).unwrap(), target);
        assert_eq!(table.get(target).unwrap().hard_links, vec![link]);
        table.unregister_hardlink(link);
        assert!(table.get(target).unwrap().hard_links.is_empty());
    }

    #[test]
    fn depth_to_root_detects_orphans() {
        let mut table = ObjectTable::new();
        let id = table.alloc_id().unwrap();
        table.insert(Object::new(id, ObjectType::File));
        assert_eq!(table.depth_to_root(id), None);
        table.add_child(OBJECTID_ROOT, id).unwrap();
        assert_eq!(table.depth_to_root(id), Some(1));
        assert_eq!(table.depth_to_root(OBJECTID_ROOT), Some(0));
    }
}
