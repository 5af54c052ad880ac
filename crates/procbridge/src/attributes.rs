//! Process attributes: working directory, environment, chroot and credentials.
//!
//! [`AttributesBuilder`] produces an immutable [`ProcessAttributes`] value that
//! a [`Session`](crate::Session) applies to every child it spawns.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::{Group, User};
use tokio::process::Command;

use crate::error::{Error, Result};

/// Identity the child switches to before `exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
    /// Leave the supplementary group list untouched.
    pub no_set_groups: bool,
    /// Supplementary groups installed when `no_set_groups` is false.
    pub groups: Vec<u32>,
}

/// Immutable launch attributes of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessAttributes {
    working_directory: Option<PathBuf>,
    environment: Option<Vec<String>>,
    chroot: Option<PathBuf>,
    credential: Option<Credential>,
}

impl ProcessAttributes {
    pub fn builder() -> AttributesBuilder {
        AttributesBuilder::default()
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    /// `KEY=VALUE` entries; `None` means the parent environment is inherited.
    pub fn environment(&self) -> Option<&[String]> {
        self.environment.as_deref()
    }

    pub fn chroot(&self) -> Option<&Path> {
        self.chroot.as_deref()
    }

    pub const fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// Check that the working directory exists and can be queried.
    pub(crate) fn check_working_directory(&self) -> Result<()> {
        let Some(dir) = self.working_directory() else {
            return Ok(());
        };
        std::fs::metadata(dir)
            .map(|_| ())
            .map_err(|e| Error::WorkingDirectory {
                path: dir.to_path_buf(),
                source: e.into(),
            })
    }

    /// Apply the attributes to a command that has not been spawned yet.
    pub(crate) fn apply(&self, cmd: &mut Command) -> Result<()> {
        if let Some(env) = &self.environment {
            cmd.env_clear();
            for entry in env {
                match entry.split_once('=') {
                    Some((key, value)) if !key.is_empty() => {
                        cmd.env(key, value);
                    }
                    _ => tracing::warn!(entry = %entry, "Skipping malformed environment entry"),
                }
            }
        }

        if self.chroot.is_none() && self.credential.is_none() {
            if let Some(dir) = &self.working_directory {
                cmd.current_dir(dir);
            }
            return Ok(());
        }

        // chroot and credential changes must happen in the forked child, in
        // the order chroot, groups, gid, uid, chdir.
        let root = self.chroot.as_deref().map(path_to_cstring).transpose()?;
        let dir = match (&self.working_directory, &root) {
            (Some(dir), _) => Some(path_to_cstring(dir)?),
            (None, Some(_)) => Some(path_to_cstring(Path::new("/"))?),
            (None, None) => None,
        };
        let credential = self.credential.clone();
        let groups: Vec<libc::gid_t> = credential
            .as_ref()
            .map(|c| c.groups.iter().map(|g| *g as libc::gid_t).collect())
            .unwrap_or_default();

        let hook = move || -> io::Result<()> {
            // SAFETY: only async-signal-safe libc calls on buffers that were
            // allocated before fork.
            #[allow(unsafe_code)]
            unsafe {
                if let Some(root) = &root
                    && libc::chroot(root.as_ptr()) != 0
                {
                    return Err(io::Error::last_os_error());
                }
                if let Some(cred) = &credential {
                    if !cred.no_set_groups
                        && libc::setgroups(groups.len() as _, groups.as_ptr()) != 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setgid(cred.gid as libc::gid_t) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                    if libc::setuid(cred.uid as libc::uid_t) != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if let Some(dir) = &dir
                    && libc::chdir(dir.as_ptr()) != 0
                {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        };

        // SAFETY: the hook allocates nothing and only calls libc functions
        // that are safe between fork and exec.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(hook);
        }
        Ok(())
    }
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        Error::Configuration(format!("path {} contains a NUL byte", path.display()))
    })
}

/// Builder for [`ProcessAttributes`].
#[derive(Debug, Clone, Default)]
pub struct AttributesBuilder {
    attributes: ProcessAttributes,
}

impl AttributesBuilder {
    /// Directory the child runs in. Defaults to the current directory.
    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attributes.working_directory = Some(dir.into());
        self
    }

    /// Replace the child environment with `KEY=VALUE` entries.
    #[must_use]
    pub fn environment<I, S>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.environment = Some(env.into_iter().map(Into::into).collect());
        self
    }

    /// Run the child chrooted into `dir`.
    #[must_use]
    pub fn chroot(mut self, dir: impl Into<PathBuf>) -> Self {
        self.attributes.chroot = Some(dir.into());
        self
    }

    /// Run the child as `uid`/`gid` with the given supplementary groups.
    #[must_use]
    pub fn sudo(mut self, uid: u32, gid: u32, no_set_groups: bool, groups: &[u32]) -> Self {
        self.attributes.credential = Some(Credential {
            uid,
            gid,
            no_set_groups,
            groups: groups.to_vec(),
        });
        self
    }

    pub fn build(self) -> ProcessAttributes {
        self.attributes
    }
}

/// Look up the numeric id of a user by name.
pub fn user_id(name: &str) -> Result<u32> {
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(Error::Lookup {
            kind: "user",
            name: name.to_string(),
            reason: "no such user".into(),
        }),
        Err(e) => Err(Error::Lookup {
            kind: "user",
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Look up the numeric id of a group by name.
pub fn group_id(name: &str) -> Result<u32> {
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(Error::Lookup {
            kind: "group",
            name: name.to_string(),
            reason: "no such group".into(),
        }),
        Err(e) => Err(Error::Lookup {
            kind: "group",
            name: name.to_string(),
            reason: e.to_string(),
        }),
    }
}
