//! Wires every built-in factory into a `Registry` (spec §4.4's
//! "`conduit.*` built-ins are always registered").

use conduit_core::error::Result;
use conduit_core::registry::Registry;

use crate::data::{csv_reader_factory, group_by_factory, sort_factory};
use crate::flow::{empty_factory, identity_factory, iterate_factory};
use crate::numerics::{eval_factory, numpy_factory};
use crate::sftp::{sftp_download_factory, sftp_list_factory};
use crate::sinks::{cli_factory, download_file_factory, file_info_factory, find_factory, path_factory};
use crate::sources::{glob_factory, input_factory, random_factory, rest_api_factory};
use crate::transforms::{console_factory, extract_factory, filter_factory, format_factory, json_query_factory, replace_factory};

/// Default channel capacity for `Fork`'s sub-pipeline edges, matching
/// `conduit_core::item::DEFAULT_CHANNEL_CAPACITY`.
const FORK_CHANNEL_CAPACITY: usize = conduit_core::item::DEFAULT_CHANNEL_CAPACITY;

pub fn register_builtins(registry: &mut Registry) -> Result<()> {
    registry.register(input_factory())?;
    registry.register(rest_api_factory())?;
    registry.register(random_factory())?;
    registry.register(glob_factory())?;

    registry.register(filter_factory())?;
    registry.register(json_query_factory())?;
    registry.register(extract_factory())?;
    registry.register(format_factory())?;
    registry.register(console_factory())?;
    registry.register(replace_factory())?;

    registry.register(iterate_factory())?;
    registry.register(identity_factory())?;
    registry.register(empty_factory())?;
    registry.register(conduit_core::fork::factory(FORK_CHANNEL_CAPACITY))?;

    registry.register(csv_reader_factory())?;
    registry.register(group_by_factory())?;
    registry.register(sort_factory())?;

    registry.register(download_file_factory())?;
    registry.register(cli_factory())?;
    registry.register(file_info_factory())?;
    registry.register(find_factory())?;
    registry.register(path_factory())?;

    registry.register(sftp_list_factory())?;
    registry.register(sftp_download_factory())?;

    registry.register(eval_factory())?;
    registry.register(numpy_factory())?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_builtin_registers_without_collision() {
        let mut registry = Registry::new();
        register_builtins(&mut registry).unwrap();
        assert!(registry.get("conduit.Input").is_some());
        assert!(registry.get("conduit.Fork").is_some());
        assert!(registry.get("conduit.Eval").is_some());
        assert!(registry.get("conduit.SftpDownload").is_some());
    }
}
