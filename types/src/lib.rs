//! Core domain types shared by the control plane crates.

mod duration;
mod package;
mod run;
mod summary;

pub use self::{
    duration::{DurationParseError, DurationString},
    package::{Package, PackageOption, RunOption},
    run::{Run, RunMeta},
    summary::{PackageSummary, RunSummary},
    test::{T, TB, TBLog, TBState, TBStateParseError, Test},
};
