mod packages;
mod runs;
mod test_results;

pub(crate) use self::{
    packages::{download_package, get_package},
    runs::{claim_run, complete_run, fail_run},
    test_results::{get_test, list_tests, submit_test},
};
