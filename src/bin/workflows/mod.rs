mod inspect;
mod layout;
mod release;

pub(crate) use inspect::{print_identity, print_matrix, print_variants, show_runs};
pub(crate) use layout::load;
pub(crate) use release::{release, ReleaseArgs};
