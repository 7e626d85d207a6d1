mod fixture;
mod test_cursor;
