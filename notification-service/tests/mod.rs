mod provider_tests;
mod retry_tests;
