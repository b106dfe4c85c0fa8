mod test_live;
mod test_payload;
mod test_schema;
