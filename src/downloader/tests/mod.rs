use std::sync::Arc;

use super::test_helpers::*;
use super::*;
use crate::error::{DownloadError, TransportError};
use crate::transport::TransportCallbacks;
use crate::types::{Action, ActiveGroup, GroupPosition, PackageComponent, Progress};

mod queue;
mod status;
