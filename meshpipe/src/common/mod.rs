// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cluster;
pub mod config;
pub mod registry;
pub mod route;
pub mod session;
