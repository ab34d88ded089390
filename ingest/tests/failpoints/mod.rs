mod batch_test;
mod transaction_test;
