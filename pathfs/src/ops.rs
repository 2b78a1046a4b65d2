//! Operation names and the registration table handed to the protocol bridge.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Access,
    Getattr,
    Readdir,
    Mknod,
    Mkdir,
    Unlink,
    Rmdir,
    Rename,
    Chmod,
    Truncate,
    Open,
    Read,
    Write,
    Link,
    Symlink,
    Readlink,
    Fgetattr,
}

impl Operation {
    pub const ALL: [Operation; 17] = [
        Operation::Access,
        Operation::Getattr,
        Operation::Readdir,
        Operation::Mknod,
        Operation::Mkdir,
        Operation::Unlink,
        Operation::Rmdir,
        Operation::Rename,
        Operation::Chmod,
        Operation::Truncate,
        Operation::Open,
        Operation::Read,
        Operation::Write,
        Operation::Link,
        Operation::Symlink,
        Operation::Readlink,
        Operation::Fgetattr,
    ];

    /// Protocol name of the operation.
    pub const fn name(self) -> &'static str {
        match self {
            Operation::Access => "access",
            Operation::Getattr => "getattr",
            Operation::Readdir => "readdir",
            Operation::Mknod => "mknod",
            Operation::Mkdir => "mkdir",
            Operation::Unlink => "unlink",
            Operation::Rmdir => "rmdir",
            Operation::Rename => "rename",
            Operation::Chmod => "chmod",
            Operation::Truncate => "truncate",
            Operation::Open => "open",
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Link => "link",
            Operation::Symlink => "symlink",
            Operation::Readlink => "readlink",
            Operation::Fgetattr => "fgetattr",
        }
    }

    pub const fn flag(self) -> OperationTable {
        match self {
            Operation::Access => OperationTable::ACCESS,
            Operation::Getattr => OperationTable::GETATTR,
            Operation::Readdir => OperationTable::READDIR,
            Operation::Mknod => OperationTable::MKNOD,
            Operation::Mkdir => OperationTable::MKDIR,
            Operation::Unlink => OperationTable::UNLINK,
            Operation::Rmdir => OperationTable::RMDIR,
            Operation::Rename => OperationTable::RENAME,
            Operation::Chmod => OperationTable::CHMOD,
            Operation::Truncate => OperationTable::TRUNCATE,
            Operation::Open => OperationTable::OPEN,
            Operation::Read => OperationTable::READ,
            Operation::Write => OperationTable::WRITE,
            Operation::Link => OperationTable::LINK,
            Operation::Symlink => OperationTable::SYMLINK,
            Operation::Readlink => OperationTable::READLINK,
            Operation::Fgetattr => OperationTable::FGETATTR,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown filesystem operation `{0}`")]
pub struct UnknownOperation(pub String);

impl FromStr for Operation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .into_iter()
            .find(|op| op.name() == s)
            .ok_or_else(|| UnknownOperation(s.to_owned()))
    }
}

bitflags! {
    /// Immutable set of operations the bridge dispatches. Anything outside it is declined the
    /// same way the protocol declines operations nobody registered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OperationTable: u32 {
        const ACCESS = 1 << 0;
        const GETATTR = 1 << 1;
        const READDIR = 1 << 2;
        const MKNOD = 1 << 3;
        const MKDIR = 1 << 4;
        const UNLINK = 1 << 5;
        const RMDIR = 1 << 6;
        const RENAME = 1 << 7;
        const CHMOD = 1 << 8;
        const TRUNCATE = 1 << 9;
        const OPEN = 1 << 10;
        const READ = 1 << 11;
        const WRITE = 1 << 12;
        const LINK = 1 << 13;
        const SYMLINK = 1 << 14;
        const READLINK = 1 << 15;
        const FGETATTR = 1 << 16;
    }
}

impl OperationTable {
    /// Everything except `fgetattr`, which stays unregistered so handle-based stat calls are
    /// answered by `getattr`.
    pub const STANDARD: OperationTable =
        OperationTable::all().difference(OperationTable::FGETATTR);

    pub const fn with(self, op: Operation) -> Self {
        self.union(op.flag())
    }

    pub const fn without(self, op: Operation) -> Self {
        self.difference(op.flag())
    }

    pub const fn handles(&self, op: Operation) -> bool {
        self.contains(op.flag())
    }

    /// Registered operations in declaration order.
    pub fn operations(&self) -> impl Iterator<Item = Operation> + '_ {
        Operation::ALL.into_iter().filter(|op| self.handles(*op))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.operations().map(Operation::name).collect()
    }
}

impl Default for OperationTable {
    fn default() -> Self {
        Self::STANDARD
    }
}
