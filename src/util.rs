pub(crate) mod reorder;
