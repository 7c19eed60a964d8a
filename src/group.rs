//! The group reader: archive member extraction to a fixed point.
//!
//! Within a group, an archive member is pulled into the link iff it defines
//! a name that is currently undefined and non-weak. Because a pulled member
//! can introduce new undefined names satisfied by an *earlier* archive, the
//! reader keeps making passes over every archive in the group until one full
//! pass adds nothing. A lone archive outside any group is a group of one.

use crate::config::Config;
use crate::error::LinkError;
use crate::input::{Input, InputType};
use crate::module::{InputId, Module};
use crate::reader::archive::Archive;
use crate::reader::{self, object};
use crate::relocate::RelocationFactory;

/// One archive opened for group iteration.
pub struct OpenArchive {
    pub input: InputId,
    bytes: Vec<u8>,
    archive: Archive,
}

impl OpenArchive {
    pub fn open(module: &Module, input: InputId) -> Result<OpenArchive, LinkError> {
        let inp = module.input(input);
        let bytes = match &inp.bytes {
            Some(b) => b.clone(),
            None => reader::load_bytes(&inp.path)?,
        };
        let archive = Archive::parse(&bytes, &inp.name)?;
        Ok(OpenArchive {
            input,
            bytes,
            archive,
        })
    }
}

pub struct GroupReader<'a> {
    pub config: &'a Config,
    pub factory: &'a RelocationFactory,
    pub machine: u16,
}

impl<'a> GroupReader<'a> {
    /// Iterate the archives of one group to a fixed point. Returns the
    /// number of members added across all passes.
    pub fn read_group(
        &self,
        module: &mut Module,
        archives: &mut [OpenArchive],
    ) -> Result<usize, LinkError> {
        let mut total = 0;

        // --whole-archive members come in unconditionally, once.
        for ar in archives.iter_mut() {
            if module.input(ar.input).attrs.whole_archive {
                for m in 0..ar.archive.members.len() {
                    if ar.archive.extract(m) {
                        total += self.ingest_member(module, ar, m)?;
                    }
                }
            }
        }

        loop {
            let mut added = 0;
            for ar in archives.iter_mut() {
                added += self.satisfy_undefined(module, ar)?;
            }
            if added == 0 {
                break;
            }
            total += added;
            log::debug!("group pass pulled {} member(s)", added);
        }
        Ok(total)
    }

    /// Extract members of one archive as long as they resolve currently
    /// undefined names.
    fn satisfy_undefined(
        &self,
        module: &mut Module,
        ar: &mut OpenArchive,
    ) -> Result<usize, LinkError> {
        let mut added = 0;
        loop {
            let mut changed = false;
            for name in module.symtab.undefined_strong_names() {
                if let Some(member) = ar.archive.member_defining(&name) {
                    if ar.archive.extract(member) {
                        added += self.ingest_member(module, ar, member)?;
                        changed = true;
                    }
                }
            }
            if !changed {
                return Ok(added);
            }
        }
    }

    fn ingest_member(
        &self,
        module: &mut Module,
        ar: &OpenArchive,
        member: usize,
    ) -> Result<usize, LinkError> {
        let parent = module.input(ar.input).name.clone();
        let member_name = format!("{}({})", parent, ar.archive.members[member].name);
        let bytes = ar.archive.member_bytes(&ar.bytes, member).to_vec();

        let mut input = Input::new(member_name, module.input(ar.input).path.clone(), InputType::Object);
        input.attrs = module.input(ar.input).attrs;
        let id = module.add_input(input);
        object::read_object(module, self.config, self.factory, id, &bytes, self.machine)?;
        Ok(1)
    }
}
