// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::serde::{
    Deserialize,
    Serialize,
};
use ::std::collections::BTreeMap;

//======================================================================================================================
// Structures
//======================================================================================================================

/// A bytecode library loaded into a VM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryInfo {
    pub uri: String,
    /// Changes whenever the library is recompiled.
    pub compile_id: u64,
    pub code_len: usize,
}

/// Position in the currently loaded code of a VM.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CodeAddress {
    /// Index into [super::VirtualMachine::libraries].
    pub library: usize,
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointTarget {
    /// Only trigger at this stack depth. Used for stepping.
    pub stack_depth: Option<usize>,
    /// Set by the user, as opposed to one installed for stepping.
    pub manual: bool,
}

/// Breakpoint as requested by a debugger client, identified by library rather than by load index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRequest {
    pub library: String,
    pub compile_id: u64,
    pub offset: u32,
    #[serde(default)]
    pub stack_depth: Option<usize>,
    #[serde(default = "default_manual")]
    pub manual: bool,
}

/// Breakpoints a debugger client wants installed in one job, replacing any previous set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointRequests {
    #[serde(default)]
    pub breakpoints: Vec<BreakpointRequest>,
    #[serde(default, rename = "minstackdepth")]
    pub min_stack_depth: Option<usize>,
    #[serde(default, rename = "maxstackdepth")]
    pub max_stack_depth: Option<usize>,
}

/// Resolved breakpoints of one VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BreakpointSet {
    pub breakpoints: BTreeMap<CodeAddress, BreakpointTarget>,
    pub min_stack_depth: Option<usize>,
    pub max_stack_depth: Option<usize>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

fn default_manual() -> bool {
    true
}

impl BreakpointSet {
    /// Resolves requests against the libraries a VM has loaded. Requests for libraries that are not loaded, that were
    /// recompiled since, or that point past the end of the code are dropped.
    pub fn resolve(requests: &BreakpointRequests, libraries: &[LibraryInfo]) -> Self {
        let mut breakpoints: BTreeMap<CodeAddress, BreakpointTarget> = BTreeMap::new();
        for request in &requests.breakpoints {
            let library: Option<usize> = libraries
                .iter()
                .position(|lib| lib.uri == request.library && lib.compile_id == request.compile_id);
            match library {
                Some(index) if (request.offset as usize) < libraries[index].code_len => {
                    breakpoints.insert(
                        CodeAddress {
                            library: index,
                            offset: request.offset,
                        },
                        BreakpointTarget {
                            stack_depth: request.stack_depth,
                            manual: request.manual,
                        },
                    );
                },
                _ => trace!("resolve(): dropping stale breakpoint {}@{}", request.library, request.offset),
            }
        }
        Self {
            breakpoints,
            min_stack_depth: requests.min_stack_depth,
            max_stack_depth: requests.max_stack_depth,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    /// Whether executing `address` at `stack_depth` should trap.
    pub fn should_break(&self, address: CodeAddress, stack_depth: usize) -> bool {
        if self.min_stack_depth.is_some_and(|min| stack_depth < min) {
            return false;
        }
        if self.max_stack_depth.is_some_and(|max| stack_depth > max) {
            return false;
        }
        match self.breakpoints.get(&address) {
            Some(BreakpointTarget {
                stack_depth: Some(depth),
                ..
            }) => *depth == stack_depth,
            Some(_) => true,
            None => false,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
