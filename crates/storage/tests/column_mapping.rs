use chainscan_storage::Column;

#[test]
fn column_indexes_follow_declaration_order() {
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
    }
}

#[test]
fn column_names_are_unique() {
    let mut names: Vec<&str> = Column::ALL.iter().map(|column| column.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), Column::ALL.len());
}
