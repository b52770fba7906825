// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    gang::{
        resources::GrType,
        scheduler::GangOptions,
    },
    iomux::IoMuxOptions,
    runtime::fail::Fail,
};
use ::std::{
    fs::File,
    io::Read,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Daemon configuration, parsed from a YAML file.
///
/// ```yaml
/// iomux:
///   buffered_stdio: true
///   max_msg_cache: 64
///   incoming_buffers: 32
///   outgoing_buffers: 128
/// gang:
///   select_type_param: core
///   sched_time_slice: 30
///   fast_schedule: true
/// ```
///
/// Every key is optional and falls back to its default.
#[derive(Debug, Clone)]
pub struct Config {
    config_obj: Yaml,
}

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Loads a configuration file.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut contents: String = String::new();
        File::open(config_path)
            .map_err(|_| Fail::new(libc::ENOENT, "could not open config file"))?
            .read_to_string(&mut contents)
            .map_err(|_| Fail::new(libc::EIO, "could not read config file"))?;
        Self::from_str(&contents)
    }

    /// Parses configuration text.
    pub fn from_str(contents: &str) -> Result<Self, Fail> {
        let mut docs: Vec<Yaml> =
            YamlLoader::load_from_str(contents).map_err(|_| Fail::new(libc::EINVAL, "malformed yaml config"))?;
        let config_obj: Yaml = match docs.len() {
            0 => Yaml::Null,
            1 => docs.remove(0),
            _ => return Err(Fail::new(libc::EINVAL, "wrong number of config documents")),
        };
        Ok(Self { config_obj })
    }

    /// Extracts the stdio multiplexer options.
    pub fn iomux_options(&self) -> Result<IoMuxOptions, Fail> {
        let section: &Yaml = &self.config_obj["iomux"];
        let defaults: IoMuxOptions = IoMuxOptions::default();
        Ok(IoMuxOptions {
            buffered_stdio: read_bool(&section["buffered_stdio"], defaults.buffered_stdio)?,
            max_msg_cache: read_usize(&section["max_msg_cache"], defaults.max_msg_cache)?,
            incoming_buffers: read_usize(&section["incoming_buffers"], defaults.incoming_buffers)?,
            outgoing_buffers: read_usize(&section["outgoing_buffers"], defaults.outgoing_buffers)?,
        })
    }

    /// Extracts the gang scheduler options.
    pub fn gang_options(&self) -> Result<GangOptions, Fail> {
        let section: &Yaml = &self.config_obj["gang"];
        let gr_type: GrType = match &section["select_type_param"] {
            Yaml::BadValue => GrType::Node,
            Yaml::String(param) => GrType::from_select_type_param(param),
            _ => return Err(Fail::new(libc::EINVAL, "select_type_param must be a string")),
        };
        let timeslice_secs: usize = read_usize(&section["sched_time_slice"], 30)?;
        if timeslice_secs == 0 {
            return Err(Fail::new(libc::EINVAL, "sched_time_slice must be positive"));
        }
        Ok(GangOptions {
            gr_type,
            timeslice: Duration::from_secs(timeslice_secs as u64),
            fast_schedule: read_bool(&section["fast_schedule"], false)?,
        })
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

fn read_bool(value: &Yaml, default: bool) -> Result<bool, Fail> {
    match value {
        Yaml::BadValue => Ok(default),
        Yaml::Boolean(b) => Ok(*b),
        _ => Err(Fail::new(libc::EINVAL, "expected a boolean config value")),
    }
}

fn read_usize(value: &Yaml, default: usize) -> Result<usize, Fail> {
    match value {
        Yaml::BadValue => Ok(default),
        Yaml::Integer(i) if *i >= 0 => Ok(*i as usize),
        _ => Err(Fail::new(libc::EINVAL, "expected a non-negative integer config value")),
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
